//! SVG previews of single blocks
//!
//! Circuit, diagram and chart blocks are wrapped in a standalone document,
//! compiled with pdflatex (no CJK setup needed) and converted to SVG with
//! `pdftocairo`, falling back to `dvisvgm`. Results are cached by content
//! hash with oldest-first eviction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::engine::{engine_args, ARTIFACT_FILE, SOURCE_FILE};
use crate::env::TexEnv;
use crate::error::PreviewError;
use crate::locate::CommandLocator;
use crate::runner::{ExitState, Invocation, ProcessRunner};

const COMPILE_TIMEOUT: Duration = Duration::from_secs(10);
const CONVERT_TIMEOUT: Duration = Duration::from_secs(5);
const SVG_FILE: &str = "document.svg";
const TIKZ_LIBRARIES: &str =
    "\\usetikzlibrary{shapes,arrows.meta,positioning,calc,decorations.markings,automata,fit}";

/// Block types that can be previewed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    /// circuitikz drawing
    Circuit,
    /// TikZ picture
    Diagram,
    /// pgfplots axis
    Chart,
    /// Body used as-is
    Raw,
}

impl PreviewKind {
    /// Lowercase name
    pub fn name(self) -> &'static str {
        match self {
            PreviewKind::Circuit => "circuit",
            PreviewKind::Diagram => "diagram",
            PreviewKind::Chart => "chart",
            PreviewKind::Raw => "raw",
        }
    }
}

impl fmt::Display for PreviewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PreviewKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "circuit" => Ok(PreviewKind::Circuit),
            "diagram" => Ok(PreviewKind::Diagram),
            "chart" => Ok(PreviewKind::Chart),
            "raw" => Ok(PreviewKind::Raw),
            other => Err(format!(
                "unknown preview kind: {other} (expected circuit, diagram, chart or raw)"
            )),
        }
    }
}

/// Standalone document around a block
pub fn wrap_block(code: &str, kind: PreviewKind) -> String {
    let mut preamble = vec![
        "\\documentclass[border=5pt,varwidth]{standalone}".to_string(),
        "\\usepackage{tikz}".to_string(),
    ];
    let body = match kind {
        PreviewKind::Circuit => {
            preamble.push("\\usepackage{circuitikz}".to_string());
            preamble.push(TIKZ_LIBRARIES.to_string());
            format!("\\begin{{circuitikz}}[american]\n{code}\n\\end{{circuitikz}}")
        }
        PreviewKind::Diagram => {
            preamble.push(TIKZ_LIBRARIES.to_string());
            format!("\\begin{{tikzpicture}}\n{code}\n\\end{{tikzpicture}}")
        }
        PreviewKind::Chart => {
            preamble.push("\\usepackage{pgfplots}".to_string());
            preamble.push("\\pgfplotsset{compat=1.18}".to_string());
            format!(
                "\\begin{{tikzpicture}}\n\\begin{{axis}}[grid=major]\n{code}\n\\end{{axis}}\n\\end{{tikzpicture}}"
            )
        }
        PreviewKind::Raw => code.to_string(),
    };
    format!(
        "{}\n\\begin{{document}}\n{body}\n\\end{{document}}\n",
        preamble.join("\n")
    )
}

/// Cache key for a block
pub fn cache_key(code: &str, kind: PreviewKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bounded map evicting the oldest insertion
struct PreviewCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl PreviewCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, svg: String) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, svg);
    }
}

/// Renders block previews
pub struct PreviewRenderer {
    runner: Arc<dyn ProcessRunner>,
    env: Arc<TexEnv>,
    gate: Arc<Semaphore>,
    pdflatex: PathBuf,
    pdftocairo: PathBuf,
    dvisvgm: PathBuf,
    memory_limit: Option<u64>,
    cache: Mutex<PreviewCache>,
}

impl PreviewRenderer {
    /// Renderer resolving its tools through `locator`
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        env: Arc<TexEnv>,
        gate: Arc<Semaphore>,
        locator: &CommandLocator,
        cache_entries: usize,
    ) -> Self {
        Self {
            runner,
            env,
            gate,
            pdflatex: locator.resolve("pdflatex"),
            pdftocairo: locator.resolve("pdftocairo"),
            dvisvgm: locator.resolve("dvisvgm"),
            memory_limit: None,
            cache: Mutex::new(PreviewCache::new(cache_entries)),
        }
    }

    /// Address-space ceiling for preview compilations
    pub fn with_memory_limit(mut self, limit: Option<u64>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// SVG for a block; empty code gives an empty string
    pub async fn render(&self, code: &str, kind: PreviewKind) -> Result<String, PreviewError> {
        if code.trim().is_empty() {
            return Ok(String::new());
        }

        let key = cache_key(code, kind);
        let cached = self.lock_cache().get(&key);
        if let Some(svg) = cached {
            debug!(kind = %kind, "preview cache hit");
            return Ok(svg);
        }

        let svg = {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| PreviewError::Compile("service is shutting down".to_string()))?;
            self.compile_to_svg(&wrap_block(code, kind)).await?
        };
        self.lock_cache().insert(key, svg.clone());
        Ok(svg)
    }

    /// Number of cached previews
    pub fn cached(&self) -> usize {
        self.lock_cache().entries.len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, PreviewCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn compile_to_svg(&self, source: &str) -> Result<String, PreviewError> {
        let scratch = TempDir::new()?;
        let tex_path = scratch.path().join(SOURCE_FILE);
        let pdf_path = scratch.path().join(ARTIFACT_FILE);
        let svg_path = scratch.path().join(SVG_FILE);
        tokio::fs::write(&tex_path, source).await?;

        let compile = Invocation::new(&self.pdflatex, self.env.clone(), COMPILE_TIMEOUT)
            .args(engine_args(scratch.path(), &tex_path))
            .cwd(scratch.path())
            .memory_limit(self.memory_limit);
        let output = self.runner.run(&compile).await;
        match &output.state {
            ExitState::NotFound => {
                return Err(PreviewError::EngineNotFound(
                    self.pdflatex.display().to_string(),
                ))
            }
            ExitState::TimedOut => return Err(PreviewError::Timeout),
            _ => {}
        }
        if !output.success() || !pdf_path.is_file() {
            let message = bang_lines(&output.combined_log());
            error!(error = %message, "preview compilation failed");
            return Err(PreviewError::Compile(message));
        }

        let cairo = Invocation::new(&self.pdftocairo, self.env.clone(), CONVERT_TIMEOUT)
            .arg("-svg")
            .arg(pdf_path.as_os_str())
            .arg(svg_path.as_os_str())
            .cwd(scratch.path());
        if let Some(svg) = self.convert(&cairo, &svg_path).await {
            return Ok(svg);
        }

        let dvisvgm = Invocation::new(&self.dvisvgm, self.env.clone(), CONVERT_TIMEOUT)
            .args(["--pdf", "--no-fonts", "--exact-bbox", "-o"])
            .arg(svg_path.as_os_str())
            .arg(pdf_path.as_os_str())
            .cwd(scratch.path());
        if let Some(svg) = self.convert(&dvisvgm, &svg_path).await {
            return Ok(svg);
        }

        Err(PreviewError::Conversion)
    }

    async fn convert(&self, invocation: &Invocation, svg_path: &Path) -> Option<String> {
        let output = self.runner.run(invocation).await;
        if output.success() {
            if let Ok(svg) = tokio::fs::read_to_string(svg_path).await {
                return Some(svg);
            }
        }
        warn!(
            converter = %invocation.program_name(),
            state = ?output.state,
            stderr = %output.stderr.trim(),
            "SVG conversion failed"
        );
        None
    }
}

/// First three `!` lines of a log
fn bang_lines(log: &str) -> String {
    let lines: Vec<&str> = log
        .lines()
        .filter(|l| l.starts_with('!'))
        .take(3)
        .collect();
    if lines.is_empty() {
        "Unknown compilation error".to_string()
    } else {
        lines.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!("Circuit".parse::<PreviewKind>().unwrap(), PreviewKind::Circuit);
        assert!("table".parse::<PreviewKind>().is_err());
    }

    #[test]
    fn test_wrap_circuit() {
        let doc = wrap_block("\\draw (0,0) to[R] (2,0);", PreviewKind::Circuit);
        assert!(doc.starts_with("\\documentclass[border=5pt,varwidth]{standalone}"));
        assert!(doc.contains("\\usepackage{circuitikz}"));
        assert!(doc.contains("\\begin{circuitikz}[american]\n\\draw (0,0) to[R] (2,0);\n\\end{circuitikz}"));
    }

    #[test]
    fn test_wrap_chart() {
        let doc = wrap_block("\\addplot {x^2};", PreviewKind::Chart);
        assert!(doc.contains("\\pgfplotsset{compat=1.18}"));
        assert!(doc.contains("\\begin{axis}[grid=major]"));
    }

    #[test]
    fn test_wrap_raw() {
        let doc = wrap_block("\\tikz \\draw (0,0) circle (1);", PreviewKind::Raw);
        assert!(!doc.contains("tikzpicture"));
        assert!(doc.contains("\\begin{document}\n\\tikz"));
    }

    #[test]
    fn test_cache_key_depends_on_kind() {
        assert_ne!(
            cache_key("x", PreviewKind::Diagram),
            cache_key("x", PreviewKind::Chart)
        );
        assert_eq!(cache_key("x", PreviewKind::Raw).len(), 64);
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = PreviewCache::new(2);
        cache.insert("a".into(), "1".into());
        cache.insert("b".into(), "2".into());
        cache.insert("c".into(), "3".into());
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_bang_lines() {
        assert_eq!(bang_lines("ok\n! A\n! B\n! C\n! D"), "! A; ! B; ! C");
        assert_eq!(bang_lines("nothing"), "Unknown compilation error");
    }
}
