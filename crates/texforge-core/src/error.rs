//! Error types for engine orchestration

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::diagnosis::Diagnosis;
use crate::engine::EngineKind;

/// Upper bound on raw log text carried in errors
pub const LOG_EXCERPT_LIMIT: usize = 2000;

/// Coarse classification of a failure, used by callers to decide what to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Engine, package or font missing on the host
    Environment,
    /// Timeout or resource-exhaustion kill; safe to retry
    Transient,
    /// The document itself was rejected
    Content,
    /// Engine claimed success but produced nothing
    Integration,
}

/// Engine name that does not match any known engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown engine: {0} (expected auto, pdflatex, xelatex or lualatex)")]
pub struct UnknownEngine(pub String);

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value could not be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Settings file is not valid TOML
    #[error("failed to parse settings file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Settings file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single attempt with a single engine
#[derive(Error, Debug)]
pub enum EngineFailure {
    /// Executable does not exist or is not runnable
    #[error("{engine} executable not found ({})", command.display())]
    NotFound { engine: EngineKind, command: PathBuf },

    /// Process could not be started for another reason
    #[error("{engine} could not be started: {reason}")]
    Spawn { engine: EngineKind, reason: String },

    /// Scratch directory could not be prepared or read
    #[error("scratch directory error for {engine}: {reason}")]
    Scratch { engine: EngineKind, reason: String },

    /// Wall-clock budget exceeded; the process was killed
    #[error("{engine} timed out after {}s", timeout.as_secs())]
    Timeout { engine: EngineKind, timeout: Duration },

    /// Terminated by a signal, usually the OOM killer or the memory ceiling
    #[error("{engine} was killed by {signal}; the host probably ran out of memory")]
    Killed {
        engine: EngineKind,
        signal: String,
        log_tail: String,
    },

    /// Nonzero exit with a diagnosed log
    #[error("{engine} failed (exit {exit_code}): {}", diagnosis.message)]
    Rejected {
        engine: EngineKind,
        exit_code: i32,
        diagnosis: Diagnosis,
        log_tail: String,
    },

    /// Exit code zero but no artifact on disk
    #[error("{engine} exited successfully but produced no PDF")]
    MissingArtifact { engine: EngineKind, log_tail: String },
}

impl EngineFailure {
    /// Engine this failure belongs to
    pub fn engine(&self) -> EngineKind {
        match self {
            EngineFailure::NotFound { engine, .. }
            | EngineFailure::Spawn { engine, .. }
            | EngineFailure::Scratch { engine, .. }
            | EngineFailure::Timeout { engine, .. }
            | EngineFailure::Killed { engine, .. }
            | EngineFailure::Rejected { engine, .. }
            | EngineFailure::MissingArtifact { engine, .. } => *engine,
        }
    }

    /// Category for the caller
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineFailure::NotFound { .. }
            | EngineFailure::Spawn { .. }
            | EngineFailure::Scratch { .. } => ErrorCategory::Environment,
            EngineFailure::Timeout { .. } | EngineFailure::Killed { .. } => ErrorCategory::Transient,
            EngineFailure::Rejected { diagnosis, .. } => diagnosis.issue.category(),
            EngineFailure::MissingArtifact { .. } => ErrorCategory::Integration,
        }
    }

    /// Whether another engine could plausibly succeed on the same document
    ///
    /// Only a recognized content signature stops the fallback chain.
    pub fn allows_fallback(&self) -> bool {
        match self {
            EngineFailure::Rejected { diagnosis, .. } => !diagnosis.issue.is_content_signature(),
            _ => true,
        }
    }

    /// Human-readable message for end users
    pub fn user_message(&self) -> String {
        match self {
            EngineFailure::NotFound { engine, .. } => {
                format!("The {engine} engine is not installed on this server.")
            }
            EngineFailure::Spawn { engine, .. } | EngineFailure::Scratch { engine, .. } => {
                format!("The {engine} engine could not be started on this server.")
            }
            EngineFailure::Timeout { .. } => {
                "PDF generation took too long. Shorten the content and try again.".to_string()
            }
            EngineFailure::Killed { signal, .. } => format!(
                "The PDF process was terminated ({signal}). The server may be out of memory."
            ),
            EngineFailure::Rejected { diagnosis, .. } => diagnosis.message.clone(),
            EngineFailure::MissingArtifact { .. } => "The PDF file was not generated.".to_string(),
        }
    }

    /// Raw log tail, if the engine produced one
    pub fn log_tail(&self) -> &str {
        match self {
            EngineFailure::Killed { log_tail, .. }
            | EngineFailure::Rejected { log_tail, .. }
            | EngineFailure::MissingArtifact { log_tail, .. } => log_tail,
            _ => "",
        }
    }
}

/// Request-level compile failure handed to callers
#[derive(Error, Debug)]
#[error("{message}")]
pub struct CompileError {
    /// Category of the deciding failure
    pub category: ErrorCategory,
    /// User-facing message
    pub message: String,
    /// Every engine attempt, in the order tried
    pub attempts: Vec<EngineFailure>,
    /// Bounded raw log text for diagnostics
    pub log_excerpt: String,
}

impl CompileError {
    /// Combine per-engine failures into one error
    ///
    /// When the chain stopped on a content error that failure decides the
    /// category; otherwise the highest-ranked attempt does.
    pub fn from_failures(attempts: Vec<EngineFailure>) -> Self {
        if attempts.is_empty() {
            return Self {
                category: ErrorCategory::Environment,
                message: "No typesetting engine is available.".to_string(),
                attempts,
                log_excerpt: String::new(),
            };
        }

        let last = &attempts[attempts.len() - 1];
        let deciding = if last.allows_fallback() {
            &attempts[0]
        } else {
            last
        };

        let tried = attempts
            .iter()
            .map(|f| f.engine().name())
            .collect::<Vec<_>>()
            .join(", ");
        let category = deciding.category();
        let message = format!("{} (engines tried: {tried})", deciding.user_message());

        let mut log = String::new();
        for failure in &attempts {
            let tail = failure.log_tail();
            let line = if tail.is_empty() {
                failure.to_string()
            } else {
                tail.to_string()
            };
            log.push_str(&format!("[{}] {}\n", failure.engine(), line));
        }

        Self {
            category,
            message,
            attempts,
            log_excerpt: log_excerpt(&log, LOG_EXCERPT_LIMIT).to_string(),
        }
    }

    /// Error for a request that never reached an engine
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Environment,
            message: reason.into(),
            attempts: Vec::new(),
            log_excerpt: String::new(),
        }
    }

    /// Engines that were attempted, in order
    pub fn engines_tried(&self) -> Vec<EngineKind> {
        self.attempts.iter().map(EngineFailure::engine).collect()
    }
}

/// Block preview failures
#[derive(Error, Debug)]
pub enum PreviewError {
    /// pdflatex is missing
    #[error("preview engine not found: {0}")]
    EngineNotFound(String),

    /// pdflatex ran too long
    #[error("preview compilation timed out")]
    Timeout,

    /// pdflatex rejected the block
    #[error("LaTeX compilation error: {0}")]
    Compile(String),

    /// Neither converter produced an SVG
    #[error("SVG conversion failed")]
    Conversion,

    /// Scratch directory error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tail of `text` no longer than `limit` bytes, cut on a char boundary
pub fn log_excerpt(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
