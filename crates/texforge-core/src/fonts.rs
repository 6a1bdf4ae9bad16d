//! CJK font selection
//!
//! xelatex needs an installed Japanese font. Detection asks fontconfig once
//! at startup and picks the first family from a preference list; explicit
//! configuration bypasses detection.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::env::TexEnv;
use crate::runner::{Invocation, ProcessRunner};

const FC_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Serif families, most preferred first
pub const MAIN_FONT_PREFERENCES: &[&str] = &[
    "Noto Serif CJK JP",
    "Noto Serif JP",
    "IPAexMincho",
    "IPAMincho",
    "Harano Aji Mincho",
    "Hiragino Mincho ProN",
];

/// Sans families, most preferred first
pub const SANS_FONT_PREFERENCES: &[&str] = &[
    "Noto Sans CJK JP",
    "Noto Sans JP",
    "IPAexGothic",
    "IPAGothic",
    "Harano Aji Gothic",
    "Hiragino Sans",
];

/// Where the font names came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FontSource {
    /// Configured explicitly
    Override,
    /// Found through fontconfig
    Detected,
    /// Nothing usable
    None,
}

/// Chosen CJK fonts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FontSelection {
    /// Serif family for body text
    pub main: Option<String>,
    /// Sans family for headings and code
    pub sans: Option<String>,
    /// Where the names came from
    pub source: FontSource,
}

impl Default for FontSelection {
    fn default() -> Self {
        Self {
            main: None,
            sans: None,
            source: FontSource::None,
        }
    }
}

impl FontSelection {
    /// Fonts given explicitly
    pub fn overridden(main: impl Into<String>, sans: Option<String>) -> Self {
        Self {
            main: Some(main.into()),
            sans,
            source: FontSource::Override,
        }
    }

    /// Whether a main CJK font is available
    pub fn has_main(&self) -> bool {
        self.main.is_some()
    }
}

/// Select fonts, running `fc-list` only when neither family is configured
///
/// A single configured family stands in for the other one.
pub async fn detect_fonts(
    runner: &Arc<dyn ProcessRunner>,
    fc_list: &Path,
    env: &Arc<TexEnv>,
    main_override: Option<String>,
    sans_override: Option<String>,
) -> FontSelection {
    if main_override.is_some() || sans_override.is_some() {
        let main = main_override.clone().or_else(|| sans_override.clone());
        let sans = sans_override.or(main_override);
        info!(main = ?main, sans = ?sans, "using configured CJK fonts");
        return FontSelection {
            main,
            sans,
            source: FontSource::Override,
        };
    }

    let invocation = Invocation::new(fc_list, env.clone(), FC_LIST_TIMEOUT)
        .args([":lang=ja", "family"]);
    let output = runner.run(&invocation).await;
    let families = if output.success() {
        parse_fc_list(&output.stdout)
    } else {
        warn!(state = ?output.state, "fc-list failed; no CJK fonts detected");
        BTreeSet::new()
    };

    let main = pick(&families, MAIN_FONT_PREFERENCES);
    let sans = pick(&families, SANS_FONT_PREFERENCES).or_else(|| main.clone());
    let source = if main.is_some() {
        FontSource::Detected
    } else {
        FontSource::None
    };
    info!(main = ?main, sans = ?sans, source = ?source, "CJK font selection");
    FontSelection { main, sans, source }
}

/// Family names from `fc-list family` output
///
/// Each line may list several comma-separated localized names.
pub fn parse_fc_list(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .flat_map(|line| line.split(','))
        .map(|name| name.trim().replace("\\-", "-"))
        .filter(|name| !name.is_empty())
        .collect()
}

/// First preferred family that is installed
pub fn pick(families: &BTreeSet<String>, preferences: &[&str]) -> Option<String> {
    preferences
        .iter()
        .find(|p| families.contains(**p))
        .map(|p| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fc_list_splits_localized_names() {
        let out = "Noto Serif CJK JP,Noto Serif CJK JP Black\nIPAexGothic,IPAexゴシック\n\n";
        let families = parse_fc_list(out);
        assert!(families.contains("Noto Serif CJK JP"));
        assert!(families.contains("IPAexGothic"));
        assert!(families.contains("IPAexゴシック"));
        assert_eq!(families.len(), 4);
    }

    #[test]
    fn test_pick_respects_preference_order() {
        let families: BTreeSet<String> = ["IPAexMincho", "Noto Serif JP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            pick(&families, MAIN_FONT_PREFERENCES).as_deref(),
            Some("Noto Serif JP")
        );
        assert_eq!(pick(&families, SANS_FONT_PREFERENCES), None);
    }

    #[test]
    fn test_default_selection_has_no_main() {
        let selection = FontSelection::default();
        assert!(!selection.has_main());
        assert_eq!(selection.source, FontSource::None);
    }

    #[tokio::test]
    async fn test_single_override_skips_fc_list() {
        use crate::runner::ProcessOutput;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct CountingRunner(AtomicUsize);

        #[async_trait]
        impl ProcessRunner for CountingRunner {
            async fn run(&self, _invocation: &Invocation) -> ProcessOutput {
                self.0.fetch_add(1, Ordering::SeqCst);
                ProcessOutput::exited(0, "Noto Serif CJK JP\nNoto Sans CJK JP\n")
            }
        }

        let counter = Arc::new(CountingRunner::default());
        let runner: Arc<dyn ProcessRunner> = counter.clone();
        let env = Arc::new(TexEnv::default());

        let main_only = detect_fonts(&runner, Path::new("fc-list"), &env, Some("IPAexMincho".into()), None).await;
        assert_eq!(main_only.main.as_deref(), Some("IPAexMincho"));
        assert_eq!(main_only.sans.as_deref(), Some("IPAexMincho"));
        assert_eq!(main_only.source, FontSource::Override);

        let sans_only = detect_fonts(&runner, Path::new("fc-list"), &env, None, Some("IPAexGothic".into())).await;
        assert!(sans_only.has_main());
        assert_eq!(sans_only.sans.as_deref(), Some("IPAexGothic"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        let detected = detect_fonts(&runner, Path::new("fc-list"), &env, None, None).await;
        assert_eq!(detected.main.as_deref(), Some("Noto Serif CJK JP"));
        assert_eq!(detected.source, FontSource::Detected);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
