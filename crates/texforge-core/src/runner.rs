//! Bounded subprocess execution
//!
//! Every external command (engines, kpsewhich, find, fc-list, converters)
//! goes through a [`ProcessRunner`]. The production runner spawns real
//! processes with a hard wall-clock timeout; tests substitute scripted
//! runners to simulate engines.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::env::TexEnv;

/// One subprocess call
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, never passed through a shell
    pub args: Vec<OsString>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Full environment for the child
    pub env: Arc<TexEnv>,
    /// Wall-clock limit; the child is killed when it expires
    pub timeout: Duration,
    /// Address-space ceiling in bytes (Linux only)
    pub memory_limit: Option<u64>,
}

impl Invocation {
    /// Invocation with no arguments
    pub fn new(program: impl Into<PathBuf>, env: Arc<TexEnv>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env,
            timeout,
            memory_limit: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set the address-space ceiling
    pub fn memory_limit(mut self, bytes: Option<u64>) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// File name of the program, for matching in logs and mocks
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Value following a flag such as `-output-directory`
    pub fn flag_value(&self, flag: &str) -> Option<&Path> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(Path::new)
    }
}

/// How a subprocess ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    /// Normal exit with a code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
    /// Killed after exceeding its timeout
    TimedOut,
    /// Executable does not exist
    NotFound,
    /// Could not be spawned for another reason
    SpawnFailed(String),
}

/// Captured result of a subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit state
    pub state: ExitState,
    /// Captured stdout, lossily decoded
    pub stdout: String,
    /// Captured stderr, lossily decoded
    pub stderr: String,
}

impl ProcessOutput {
    /// Normal exit
    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            state: ExitState::Exited(code),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Output-less state such as a timeout
    pub fn with_state(state: ExitState) -> Self {
        Self {
            state,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Exit code zero
    pub fn success(&self) -> bool {
        self.state == ExitState::Exited(0)
    }

    /// stdout followed by stderr
    pub fn combined_log(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs subprocesses
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion or timeout; never panics and never exceeds `timeout`
    async fn run(&self, invocation: &Invocation) -> ProcessOutput;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRunner;

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(&self, invocation: &Invocation) -> ProcessOutput {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env_clear()
            .envs(invocation.env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        #[cfg(target_os = "linux")]
        if let Some(bytes) = invocation.memory_limit {
            apply_memory_limit(&mut command, bytes);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProcessOutput::with_state(ExitState::NotFound);
            }
            Err(e) => return ProcessOutput::with_state(ExitState::SpawnFailed(e.to_string())),
        };

        // Dropping the future on timeout drops the child, and kill_on_drop reaps it.
        match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ProcessOutput {
                state: exit_state(output.status),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => ProcessOutput::with_state(ExitState::SpawnFailed(e.to_string())),
            Err(_) => {
                debug!(
                    program = %invocation.program.display(),
                    timeout_secs = invocation.timeout.as_secs_f64(),
                    "subprocess timed out"
                );
                ProcessOutput::with_state(ExitState::TimedOut)
            }
        }
    }
}

fn exit_state(status: std::process::ExitStatus) -> ExitState {
    if let Some(code) = status.code() {
        return ExitState::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitState::Signaled(signal);
        }
    }
    ExitState::Exited(-1)
}

#[cfg(target_os = "linux")]
fn apply_memory_limit(command: &mut Command, bytes: u64) {
    // SAFETY: the closure runs between fork and exec and only calls setrlimit,
    // which is async-signal-safe. A failed setrlimit leaves the child unlimited.
    unsafe {
        command.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            libc::setrlimit(libc::RLIMIT_AS, &limit);
            Ok(())
        });
    }
}

/// Readable name for a terminating signal
pub fn signal_name(signal: i32) -> String {
    match signal {
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}
