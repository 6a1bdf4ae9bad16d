//! Engine log classification
//!
//! Maps the text an engine printed before failing to a user-facing issue.
//! This is heuristic: rules are plain substring or regex checks evaluated in
//! order, first match wins. Add new signatures near the rule they refine.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::ErrorCategory;

/// What a failed engine log most likely complains about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogIssue {
    /// Command not defined by any loaded package
    UndefinedCommand,
    /// Math delimiter missing or unbalanced
    MathDelimiter,
    /// Table row has more cells than the column spec
    TableColumns,
    /// An included image could not be read
    MissingImage,
    /// A style or class file is not installed
    MissingPackage,
    /// A font could not be loaded
    MissingFont,
    /// The engine aborted with an emergency stop
    FatalError,
    /// Some other input file could not be found
    MissingFile,
    /// No rule matched
    Unrecognized,
}

impl LogIssue {
    /// Category reported to callers
    pub fn category(self) -> ErrorCategory {
        match self {
            LogIssue::MissingPackage | LogIssue::MissingFont | LogIssue::MissingFile => {
                ErrorCategory::Environment
            }
            _ => ErrorCategory::Content,
        }
    }

    /// True when the same document would fail identically on any engine
    pub fn is_content_signature(self) -> bool {
        matches!(
            self,
            LogIssue::UndefinedCommand
                | LogIssue::MathDelimiter
                | LogIssue::TableColumns
                | LogIssue::MissingImage
                | LogIssue::FatalError
        )
    }
}

/// Result of classifying a log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    /// Matched issue
    pub issue: LogIssue,
    /// First error line of the log, when one could be found
    pub detail: Option<String>,
    /// User-facing message
    pub message: String,
}

enum Matcher {
    Contains(&'static str),
    AllOf(&'static [&'static str]),
    Pattern(Regex),
    AnyOf(Vec<Matcher>),
}

impl Matcher {
    fn matches(&self, lower: &str, raw: &str) -> bool {
        match self {
            Matcher::Contains(needle) => lower.contains(*needle),
            Matcher::AllOf(needles) => needles.iter().all(|n| lower.contains(*n)),
            Matcher::Pattern(re) => re.is_match(raw),
            Matcher::AnyOf(matchers) => matchers.iter().any(|m| m.matches(lower, raw)),
        }
    }
}

struct Rule {
    issue: LogIssue,
    matcher: Matcher,
}

fn pattern(re: &str) -> Matcher {
    // Literal patterns; test_rules_compile covers them.
    Matcher::Pattern(Regex::new(re).expect("valid rule pattern"))
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule {
            issue: LogIssue::UndefinedCommand,
            matcher: Matcher::Contains("undefined control sequence"),
        },
        Rule {
            issue: LogIssue::MathDelimiter,
            matcher: Matcher::Contains("missing $ inserted"),
        },
        Rule {
            issue: LogIssue::TableColumns,
            matcher: Matcher::AnyOf(vec![
                Matcher::Contains("extra alignment tab"),
                Matcher::Contains("misplaced"),
            ]),
        },
        Rule {
            issue: LogIssue::MissingImage,
            matcher: Matcher::AnyOf(vec![
                Matcher::AllOf(&["file not found", "image"]),
                pattern(r"(?i)file `[^']+\.(png|jpe?g|gif|eps|svg|pdf)' not found"),
            ]),
        },
        Rule {
            issue: LogIssue::MissingPackage,
            matcher: Matcher::AnyOf(vec![
                pattern(r"(?i)file `[^']+\.(sty|cls|def)' not found"),
                Matcher::AllOf(&["luatexja", "not found"]),
            ]),
        },
        Rule {
            issue: LogIssue::MissingFont,
            matcher: Matcher::AnyOf(vec![
                Matcher::Contains("fontspec error"),
                Matcher::AllOf(&["fontspec", "not found"]),
                pattern(r"(?i)font\b.*\bcannot be found"),
            ]),
        },
        Rule {
            issue: LogIssue::FatalError,
            matcher: Matcher::Contains("emergency stop"),
        },
        Rule {
            issue: LogIssue::MissingFile,
            matcher: Matcher::Contains("file not found"),
        },
    ]
});

/// Classify an engine log
pub fn diagnose(log: &str) -> Diagnosis {
    let lower = log.to_lowercase();
    let detail = error_line(log);

    let issue = RULES
        .iter()
        .find(|rule| rule.matcher.matches(&lower, log))
        .map(|rule| rule.issue)
        .unwrap_or(LogIssue::Unrecognized);

    let message = message_for(issue, detail.as_deref(), log);
    Diagnosis {
        issue,
        detail,
        message,
    }
}

/// First `!` line, else the first short line mentioning an error
fn error_line(log: &str) -> Option<String> {
    let bang = log
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('!'));
    if let Some(line) = bang {
        return Some(line.to_string());
    }

    log.lines().map(str::trim).find_map(|line| {
        let lower = line.to_lowercase();
        let mentions_error = lower.contains("fatal") || lower.contains("error");
        (mentions_error && line.len() > 10 && line.len() < 200).then(|| line.to_string())
    })
}

fn message_for(issue: LogIssue, detail: Option<&str>, log: &str) -> String {
    let suffix = detail.map(|d| format!(" ({d})")).unwrap_or_default();
    match issue {
        LogIssue::UndefinedCommand => {
            format!("The document uses an undefined command. Check the input.{suffix}")
        }
        LogIssue::MathDelimiter => "A math expression could not be processed. Check for stray $ or % characters in the input.".to_string(),
        LogIssue::TableColumns => {
            "A table row does not match the number of columns. Check the table contents.".to_string()
        }
        LogIssue::MissingImage => {
            "An image could not be loaded. Check that the image URL is correct.".to_string()
        }
        LogIssue::MissingPackage => format!(
            "A required LaTeX package is not installed on the server.{suffix}"
        ),
        LogIssue::MissingFont => format!("A font could not be loaded.{suffix}"),
        LogIssue::FatalError => {
            format!("A fatal error occurred while processing the document.{suffix}")
        }
        LogIssue::MissingFile => format!("A required file was not found.{suffix}"),
        LogIssue::Unrecognized => match detail {
            Some(d) => format!("PDF compilation error: {d}"),
            None => {
                let tail = meaningful_tail(log);
                if tail.is_empty() {
                    "PDF generation failed. Check the server log.".to_string()
                } else {
                    format!("PDF compilation failed (log: {tail})")
                }
            }
        },
    }
}

/// Last few non-file-trace lines, capped for display
fn meaningful_tail(log: &str) -> String {
    let lines: Vec<&str> = log
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('('))
        .collect();
    let start = lines.len().saturating_sub(5);
    let joined = lines[start..].join("; ");
    joined.chars().take(200).collect()
}
