//! Bounded compilation with engine fallback
//!
//! Every request passes a fair concurrency gate first; each engine run is
//! a separate process that can take hundreds of megabytes, so the gate is
//! the main protection for small hosts. Inside the gate the request waits
//! briefly for warmup, reads the current ranking and walks it until an
//! engine produces a PDF or a content error shows the document itself is
//! at fault.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::diagnosis::diagnose;
use crate::engine::{engine_args, EngineChoice, EngineKind, ARTIFACT_FILE, SOURCE_FILE};
use crate::env::TexEnv;
use crate::error::{log_excerpt, CompileError, EngineFailure, LOG_EXCERPT_LIMIT};
use crate::runner::{signal_name, ExitState, Invocation, ProcessOutput, ProcessRunner};
use crate::selector::EngineSelector;
use crate::warmup::WarmupState;

/// Name of the engine log inside the scratch directory
const LOG_FILE: &str = "document.log";

/// Time and memory budgets for one engine run
#[derive(Debug, Clone, Copy)]
pub struct CompileLimits {
    /// Wall-clock budget for a warm engine
    pub timeout: Duration,
    /// Extra budget while the engine's caches are cold (not yet verified)
    pub cold_extra: Duration,
    /// Address-space ceiling in bytes
    pub memory_limit: Option<u64>,
    /// How long a request waits for warmup before using the static ranking
    pub warmup_wait: Duration,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            cold_extra: Duration::from_secs(20),
            memory_limit: Some(1536 * 1024 * 1024),
            warmup_wait: Duration::from_millis(3000),
        }
    }
}

/// A source document to compile
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Complete LaTeX source
    pub source: String,
    /// Engine preference
    pub choice: EngineChoice,
}

impl CompileRequest {
    /// Request using the current ranking
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            choice: EngineChoice::Auto,
        }
    }

    /// Request with an explicit engine choice
    pub fn with_choice(mut self, choice: EngineChoice) -> Self {
        self.choice = choice;
        self
    }
}

/// A produced PDF
#[derive(Debug)]
pub struct CompileOutput {
    /// PDF bytes
    pub pdf: Vec<u8>,
    /// Engine that produced it
    pub engine: EngineKind,
    /// Failures of higher-ranked engines tried first
    pub fallbacks: Vec<EngineFailure>,
    /// Time spent inside the gate
    pub elapsed: Duration,
}

/// Runs engines for compile requests
pub struct CompilationDriver {
    runner: Arc<dyn ProcessRunner>,
    env: Arc<TexEnv>,
    gate: Arc<Semaphore>,
    selector: Arc<EngineSelector>,
    warmup: Arc<WarmupState>,
    breaker: Arc<CircuitBreaker>,
    limits: CompileLimits,
}

impl CompilationDriver {
    /// Driver sharing the service's gate and state
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        env: Arc<TexEnv>,
        gate: Arc<Semaphore>,
        selector: Arc<EngineSelector>,
        warmup: Arc<WarmupState>,
        breaker: Arc<CircuitBreaker>,
        limits: CompileLimits,
    ) -> Self {
        Self {
            runner,
            env,
            gate,
            selector,
            warmup,
            breaker,
            limits,
        }
    }

    /// Budgets in effect
    pub fn limits(&self) -> &CompileLimits {
        &self.limits
    }

    /// Compile `request`, falling back through the ranking
    ///
    /// All engine runs of one request share a single budget of
    /// `timeout + cold_extra`; a fallback engine only gets what is left.
    pub async fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| CompileError::unavailable("The compilation service is shutting down."))?;
        let started = Instant::now();

        if !self.limits.warmup_wait.is_zero() && !self.warmup.is_done() {
            let ready = self.warmup.wait(self.limits.warmup_wait).await;
            debug!(ready, "waited for warmup");
        }

        let ranking = self.selector.ranking();
        let plan = ranking.plan(request.choice);
        debug!(plan = ?plan, "engine plan");

        let deadline = Instant::now() + self.request_budget();
        let mut failures: Vec<EngineFailure> = Vec::new();
        for kind in plan {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    engine = %kind,
                    budget_secs = self.request_budget().as_secs(),
                    "compile budget used up; not trying further engines"
                );
                break;
            }

            let timeout = self.timeout_for(kind).min(remaining);
            match self.attempt(kind, &request.source, timeout).await {
                Ok(pdf) => {
                    self.breaker.record_success(kind);
                    let elapsed = started.elapsed();
                    info!(
                        engine = %kind,
                        bytes = pdf.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "compiled"
                    );
                    return Ok(CompileOutput {
                        pdf,
                        engine: kind,
                        fallbacks: failures,
                        elapsed,
                    });
                }
                Err(failure) => {
                    self.breaker.record_failure(kind, failure.category());
                    warn!(engine = %kind, category = ?failure.category(), error = %failure, "engine attempt failed");
                    let stop = !failure.allows_fallback();
                    failures.push(failure);
                    if stop {
                        break;
                    }
                }
            }
        }

        Err(CompileError::from_failures(failures))
    }

    /// Wall-clock budget shared by every engine run of one request
    pub fn request_budget(&self) -> Duration {
        self.limits.timeout + self.limits.cold_extra
    }

    /// Wall-clock budget for one run of `kind`
    pub fn timeout_for(&self, kind: EngineKind) -> Duration {
        if self.warmup.is_verified(kind) {
            self.limits.timeout
        } else {
            self.limits.timeout + self.limits.cold_extra
        }
    }

    /// One engine run in a scratch directory that is removed on return
    async fn attempt(
        &self,
        kind: EngineKind,
        source: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineFailure> {
        let scratch_err = |e: std::io::Error| EngineFailure::Scratch {
            engine: kind,
            reason: e.to_string(),
        };
        let scratch = TempDir::new().map_err(scratch_err)?;
        let tex_path = scratch.path().join(SOURCE_FILE);
        tokio::fs::write(&tex_path, source).await.map_err(scratch_err)?;

        let command = self.selector.command(kind);
        let invocation = Invocation::new(command, self.env.clone(), timeout)
            .args(engine_args(scratch.path(), &tex_path))
            .cwd(scratch.path())
            .memory_limit(self.limits.memory_limit);
        let output = self.runner.run(&invocation).await;

        match &output.state {
            ExitState::Exited(0) => {
                match tokio::fs::read(scratch.path().join(ARTIFACT_FILE)).await {
                    Ok(pdf) if !pdf.is_empty() => Ok(pdf),
                    _ => {
                        warn!(engine = %kind, "engine exited 0 without a PDF");
                        Err(EngineFailure::MissingArtifact {
                            engine: kind,
                            log_tail: tail(&output.combined_log()),
                        })
                    }
                }
            }
            ExitState::Exited(exit_code) => {
                let log = engine_log(&scratch, &output).await;
                Err(EngineFailure::Rejected {
                    engine: kind,
                    exit_code: *exit_code,
                    diagnosis: diagnose(&log),
                    log_tail: tail(&log),
                })
            }
            ExitState::Signaled(signal) => Err(EngineFailure::Killed {
                engine: kind,
                signal: signal_name(*signal),
                log_tail: tail(&output.combined_log()),
            }),
            ExitState::TimedOut => Err(EngineFailure::Timeout {
                engine: kind,
                timeout,
            }),
            ExitState::NotFound => Err(EngineFailure::NotFound {
                engine: kind,
                command: command.to_path_buf(),
            }),
            ExitState::SpawnFailed(reason) => Err(EngineFailure::Spawn {
                engine: kind,
                reason: reason.clone(),
            }),
        }
    }
}

/// Engine output, or the log file when the engine printed nothing
async fn engine_log(scratch: &TempDir, output: &ProcessOutput) -> String {
    if !output.stdout.trim().is_empty() {
        return output.combined_log();
    }
    match tokio::fs::read(scratch.path().join(LOG_FILE)).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => output.combined_log(),
    }
}

fn tail(log: &str) -> String {
    log_excerpt(log, LOG_EXCERPT_LIMIT).to_string()
}
