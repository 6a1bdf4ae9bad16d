//! Compile-Test harness
//!
//! The ground-truth availability check: compile a tiny Japanese document
//! with an engine and look for the PDF. Exit code zero alone is not trusted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::engine::{engine_args, EngineCandidate, EngineKind, ARTIFACT_FILE, SOURCE_FILE};
use crate::env::TexEnv;
use crate::fonts::FontSelection;
use crate::runner::{signal_name, ExitState, Invocation, ProcessRunner};

/// Why a Compile-Test failed, kept for logs and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    /// Exit code zero and the PDF exists
    Passed,
    /// Killed after the tier timeout
    TimedOut,
    /// Nonzero exit
    Rejected { exit_code: i32 },
    /// Terminated by a signal
    Killed { signal: String },
    /// Exit code zero without a PDF
    MissingArtifact,
    /// Executable not found
    NotFound,
    /// Could not prepare or start the run
    Failed { reason: String },
}

impl TestOutcome {
    /// Whether the engine is verified by this outcome
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }
}

/// Result of one Compile-Test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    /// Engine tested
    pub engine: EngineKind,
    /// What happened
    #[serde(flatten)]
    pub outcome: TestOutcome,
    /// Wall-clock time of the run
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl TestReport {
    /// Whether the engine is verified
    pub fn passed(&self) -> bool {
        self.outcome.passed()
    }
}

/// Anything that can verify an engine by compiling
///
/// The warmup scheduler only talks to this trait, so tests can script
/// outcomes and delays without spawning processes.
#[async_trait]
pub trait CompileTester: Send + Sync {
    /// Run one Compile-Test; must not panic and must be time-bounded
    async fn test_engine(&self, candidate: &EngineCandidate) -> TestReport;
}

/// Compile-Test harness that runs the real engines
pub struct CompileTestHarness {
    runner: Arc<dyn ProcessRunner>,
    env: Arc<TexEnv>,
    fonts: FontSelection,
    memory_limit: Option<u64>,
}

impl CompileTestHarness {
    /// Harness sharing the service's runner and frozen environment
    pub fn new(runner: Arc<dyn ProcessRunner>, env: Arc<TexEnv>, fonts: FontSelection) -> Self {
        Self {
            runner,
            env,
            fonts,
            memory_limit: None,
        }
    }

    /// Address-space ceiling for every Compile-Test run
    pub fn with_memory_limit(mut self, limit: Option<u64>) -> Self {
        self.memory_limit = limit;
        self
    }

    async fn run(&self, candidate: &EngineCandidate) -> TestOutcome {
        let kind = candidate.kind;
        let scratch = match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => {
                return TestOutcome::Failed {
                    reason: format!("scratch directory: {e}"),
                }
            }
        };
        let tex_path = scratch.path().join(SOURCE_FILE);
        if let Err(e) = tokio::fs::write(&tex_path, test_document(kind, &self.fonts)).await {
            return TestOutcome::Failed {
                reason: format!("write test document: {e}"),
            };
        }

        let invocation = Invocation::new(&candidate.command, self.env.clone(), kind.spec().test_tier.timeout())
            .args(engine_args(scratch.path(), &tex_path))
            .cwd(scratch.path())
            .memory_limit(self.memory_limit);
        let output = self.runner.run(&invocation).await;

        let outcome = match &output.state {
            ExitState::Exited(0) => {
                let artifact = scratch.path().join(ARTIFACT_FILE);
                match tokio::fs::metadata(&artifact).await {
                    Ok(meta) if meta.len() > 0 => TestOutcome::Passed,
                    _ => TestOutcome::MissingArtifact,
                }
            }
            ExitState::Exited(code) => TestOutcome::Rejected { exit_code: *code },
            ExitState::Signaled(signal) => TestOutcome::Killed {
                signal: signal_name(*signal),
            },
            ExitState::TimedOut => TestOutcome::TimedOut,
            ExitState::NotFound => TestOutcome::NotFound,
            ExitState::SpawnFailed(reason) => TestOutcome::Failed {
                reason: reason.clone(),
            },
        };

        if !outcome.passed() {
            warn!(
                engine = %kind,
                outcome = ?outcome,
                log = %last_lines(&output.stdout, 5),
                "compile test failed"
            );
        }
        outcome
    }
}

#[async_trait]
impl CompileTester for CompileTestHarness {
    async fn test_engine(&self, candidate: &EngineCandidate) -> TestReport {
        let started = Instant::now();
        let outcome = self.run(candidate).await;
        let elapsed = started.elapsed();
        if outcome.passed() {
            info!(engine = %candidate.kind, elapsed_ms = elapsed.as_millis() as u64, "compile test passed");
        }
        TestReport {
            engine: candidate.kind,
            outcome,
            elapsed,
        }
    }
}

/// Minimal document exercising each engine's CJK stack
pub fn test_document(kind: EngineKind, fonts: &FontSelection) -> String {
    let preamble = match kind {
        EngineKind::PdfLatex => "\\usepackage[whole]{bxcjkjatype}\n".to_string(),
        EngineKind::XeLatex => match &fonts.main {
            Some(main) => format!("\\usepackage{{fontspec}}\n\\usepackage{{xeCJK}}\n\\setCJKmainfont{{{main}}}\n"),
            None => "\\usepackage{fontspec}\n".to_string(),
        },
        EngineKind::LuaLatex => {
            "\\usepackage{luatexja}\n\\usepackage[haranoaji]{luatexja-preset}\n".to_string()
        }
    };
    format!("\\documentclass{{article}}\n{preamble}\\begin{{document}}\ntest テスト\n\\end{{document}}\n")
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
