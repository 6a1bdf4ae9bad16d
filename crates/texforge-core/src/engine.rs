//! Engine identities and their static requirements
//!
//! Every engine the service can drive is a variant of [`EngineKind`]. The
//! per-engine facts (command, support packages, font needs, priority) live
//! in one lookup table so the rest of the crate never compares engine names
//! as strings.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::UnknownEngine;

/// File name of the source document inside a scratch directory
pub const SOURCE_FILE: &str = "document.tex";

/// File name of the artifact the engine is expected to produce
pub const ARTIFACT_FILE: &str = "document.pdf";

/// Typesetting engines, declared in priority order (cheapest first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// pdfTeX with the bxcjkjatype/CJK bundle
    PdfLatex,
    /// XeTeX with fontspec/xeCJK and a system CJK font
    XeLatex,
    /// LuaTeX with luatexja and the bundled Harano Aji fonts
    LuaLatex,
}

impl EngineKind {
    /// All engines in fixed priority order
    pub const ALL: [EngineKind; 3] = [EngineKind::PdfLatex, EngineKind::XeLatex, EngineKind::LuaLatex];

    /// Canonical lowercase name
    pub fn name(self) -> &'static str {
        self.spec().command
    }

    /// Static requirements for this engine
    pub fn spec(self) -> &'static EngineSpec {
        &ENGINE_TABLE[self.index()]
    }

    /// Priority rank, lower is preferred
    pub fn priority(self) -> u8 {
        self.spec().priority
    }

    pub(crate) fn index(self) -> usize {
        match self {
            EngineKind::PdfLatex => 0,
            EngineKind::XeLatex => 1,
            EngineKind::LuaLatex => 2,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineKind {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        EngineKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| UnknownEngine(s.to_string()))
    }
}

/// Font dependency beyond what the TeX distribution ships
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FontRequirement {
    /// A Japanese system font reachable through fontconfig
    CjkSystemFont,
}

/// How long a Compile-Test may take for an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestTier {
    /// Engines that start quickly
    Fast,
    /// Engines that build a font cache on first run
    Slow,
}

impl TestTier {
    /// Wall-clock budget for one Compile-Test
    pub fn timeout(self) -> Duration {
        match self {
            TestTier::Fast => Duration::from_secs(30),
            TestTier::Slow => Duration::from_secs(180),
        }
    }
}

/// Static description of one engine
#[derive(Debug)]
pub struct EngineSpec {
    /// Engine identity
    pub kind: EngineKind,
    /// Executable name looked up by the command locator
    pub command: &'static str,
    /// Support files that must all resolve
    pub packages: &'static [&'static str],
    /// Optional font requirement
    pub font: Option<FontRequirement>,
    /// Resource-cost rank, lower is cheaper
    pub priority: u8,
    /// Compile-Test timeout tier
    pub test_tier: TestTier,
}

static ENGINE_TABLE: [EngineSpec; 3] = [
    EngineSpec {
        kind: EngineKind::PdfLatex,
        command: "pdflatex",
        packages: &["CJK.sty", "bxcjkjatype.sty"],
        font: None,
        priority: 0,
        test_tier: TestTier::Fast,
    },
    EngineSpec {
        kind: EngineKind::XeLatex,
        command: "xelatex",
        packages: &["fontspec.sty", "xeCJK.sty"],
        font: Some(FontRequirement::CjkSystemFont),
        priority: 1,
        test_tier: TestTier::Fast,
    },
    EngineSpec {
        kind: EngineKind::LuaLatex,
        command: "lualatex",
        packages: &[
            "luatexja.sty",
            "luatexja-preset.sty",
            "HaranoAjiMincho-Regular.otf",
        ],
        font: None,
        priority: 2,
        test_tier: TestTier::Slow,
    },
];

/// Which engine a compile request wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineChoice {
    /// Use the current ranking
    #[default]
    Auto,
    /// Try this engine first, then the rest of the ranking
    Prefer(EngineKind),
    /// Use only this engine
    Require(EngineKind),
}

impl FromStr for EngineChoice {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(EngineChoice::Auto);
        }
        s.parse().map(EngineChoice::Prefer)
    }
}

/// An engine as found on this host
///
/// Built once during bootstrap. Verification state is not stored here; it
/// lives in the warmup state so readers never need a lock on candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineCandidate {
    /// Engine identity
    pub kind: EngineKind,
    /// Resolved executable path (bare name when unresolved)
    pub command: PathBuf,
    /// Whether the executable exists on disk
    pub command_found: bool,
    /// Requirements that static probing could not satisfy
    pub missing: Vec<String>,
    /// Executable, packages and fonts all present
    pub available: bool,
}

impl EngineCandidate {
    /// Build a candidate from probing results
    pub fn new(kind: EngineKind, command: PathBuf, command_found: bool, missing: Vec<String>) -> Self {
        let available = command_found && missing.is_empty();
        Self {
            kind,
            command,
            command_found,
            missing,
            available,
        }
    }

    /// Candidate that passed every static check, mostly for tests
    pub fn available(kind: EngineKind, command: impl Into<PathBuf>) -> Self {
        Self::new(kind, command.into(), true, Vec::new())
    }
}

/// Command-line arguments for a non-interactive, halt-on-error run
pub fn engine_args(output_dir: &Path, tex_path: &Path) -> Vec<OsString> {
    vec![
        "-interaction=nonstopmode".into(),
        "-halt-on-error".into(),
        "-file-line-error".into(),
        "-no-shell-escape".into(),
        "-output-directory".into(),
        output_dir.as_os_str().to_owned(),
        tex_path.as_os_str().to_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_variants() {
        for kind in EngineKind::ALL {
            assert_eq!(kind.spec().kind, kind);
        }
    }

    #[test]
    fn test_priority_follows_declaration_order() {
        let priorities: Vec<u8> = EngineKind::ALL.iter().map(|k| k.priority()).collect();
        assert_eq!(priorities, vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_engine_names() {
        assert_eq!("pdflatex".parse::<EngineKind>().unwrap(), EngineKind::PdfLatex);
        assert_eq!(" XeLaTeX ".parse::<EngineKind>().unwrap(), EngineKind::XeLatex);
        assert!("context".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_parse_engine_choice() {
        assert_eq!("auto".parse::<EngineChoice>().unwrap(), EngineChoice::Auto);
        assert_eq!(
            "lualatex".parse::<EngineChoice>().unwrap(),
            EngineChoice::Prefer(EngineKind::LuaLatex)
        );
    }

    #[test]
    fn test_candidate_availability() {
        let ok = EngineCandidate::new(EngineKind::PdfLatex, "/usr/bin/pdflatex".into(), true, vec![]);
        assert!(ok.available);

        let missing = EngineCandidate::new(
            EngineKind::PdfLatex,
            "/usr/bin/pdflatex".into(),
            true,
            vec!["CJK.sty".to_string()],
        );
        assert!(!missing.available);

        let no_binary = EngineCandidate::new(EngineKind::XeLatex, "xelatex".into(), false, vec![]);
        assert!(!no_binary.available);
    }

    #[test]
    fn test_engine_args_are_non_interactive() {
        let args = engine_args(Path::new("/tmp/x"), Path::new("/tmp/x/document.tex"));
        assert_eq!(args[0], "-interaction=nonstopmode");
        assert!(args.contains(&OsString::from("-halt-on-error")));
        assert!(args.contains(&OsString::from("-no-shell-escape")));
        assert_eq!(args.last().unwrap(), "/tmp/x/document.tex");
    }
}
