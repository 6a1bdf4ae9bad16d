//! # texforge-core
//!
//! Engine selection, probing, warmup and bounded compilation for LaTeX
//! documents with Japanese text.
//!
//! Three engines are supported (`pdflatex`, `xelatex`, `lualatex`), each
//! with its own package and font needs. At startup the service resolves
//! executables and probes packages (fast, synchronous); a background
//! warmup then compiles a tiny document with every engine that looks
//! installed, refining the ranking requests use.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use texforge_core::{CompileRequest, Settings, TexService};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = TexService::bootstrap(Settings::load(None)?).await;
//! service.start_warmup();
//!
//! let source = "\\documentclass{article}\\begin{document}Hello\\end{document}";
//! let output = service.compile(&CompileRequest::new(source)).await?;
//! println!("{} bytes from {}", output.pdf.len(), output.engine);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod diagnosis;
pub mod driver;
pub mod engine;
pub mod env;
pub mod error;
pub mod fonts;
pub mod harness;
pub mod locate;
pub mod preview;
pub mod probe;
pub mod runner;
pub mod selector;
pub mod service;
pub mod warmup;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::Settings;
pub use diagnosis::{diagnose, Diagnosis, LogIssue};
pub use driver::{CompilationDriver, CompileLimits, CompileOutput, CompileRequest};
pub use engine::{EngineCandidate, EngineChoice, EngineKind};
pub use env::TexEnv;
pub use error::{CompileError, ConfigError, EngineFailure, ErrorCategory, PreviewError};
pub use fonts::{FontSelection, FontSource};
pub use harness::{CompileTestHarness, CompileTester, TestOutcome, TestReport};
pub use locate::CommandLocator;
pub use preview::PreviewKind;
pub use probe::{PackageProber, PackageResolution, ProbeReport};
pub use runner::{ExitState, Invocation, ProcessOutput, ProcessRunner, TokioRunner};
pub use selector::{EngineSelector, Ranking, Tier};
pub use service::{ServiceStatus, TexService};
pub use warmup::{WarmupPhase, WarmupScheduler, WarmupState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
