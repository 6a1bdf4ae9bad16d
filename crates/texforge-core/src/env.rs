//! Subprocess environment for TeX commands
//!
//! Built once during bootstrap, then frozen behind an `Arc` and handed to
//! every invocation. Nothing mutates it while requests are being served.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

/// Separator between entries of kpathsea search variables
#[cfg(windows)]
const SEARCH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const SEARCH_SEPARATOR: char = ':';

/// Ghostscript shared libraries that `dvisvgm --pdf` can load
pub const LIBGS_CANDIDATES: &[&str] = &[
    "/opt/homebrew/lib/libgs.dylib",
    "/usr/local/lib/libgs.dylib",
    "/usr/lib/x86_64-linux-gnu/libgs.so",
    "/usr/lib/aarch64-linux-gnu/libgs.so",
    "/usr/lib64/libgs.so",
    "/usr/lib/libgs.so",
];

/// Environment variables passed to every TeX subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TexEnv {
    vars: BTreeMap<String, String>,
}

impl TexEnv {
    /// Snapshot of the current process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Environment from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set a variable
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// All variables
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Put existing directories in front of `PATH`, skipping ones already listed
    ///
    /// Returns the directories that were added.
    pub fn prepend_path_dirs(&mut self, dirs: &[PathBuf]) -> Vec<PathBuf> {
        let current: Vec<PathBuf> = self
            .get("PATH")
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();

        let added: Vec<PathBuf> = dirs
            .iter()
            .filter(|d| d.is_dir() && !current.contains(*d))
            .cloned()
            .collect();
        if added.is_empty() {
            return added;
        }

        let joined = std::env::join_paths(added.iter().chain(current.iter()));
        match joined {
            Ok(value) => {
                self.set("PATH", value.to_string_lossy());
                info!(dirs = ?added, "added TeX directories to PATH");
                added
            }
            // A directory containing the separator cannot be represented; leave PATH alone.
            Err(_) => Vec::new(),
        }
    }

    /// Register a directory for recursive package lookup through `TEXINPUTS`
    ///
    /// The trailing separator keeps the engine's default search path active.
    /// Returns false if the directory was already registered.
    pub fn register_texinputs(&mut self, dir: &Path) -> bool {
        let dir = dir.to_string_lossy();
        let current = self.get("TEXINPUTS").unwrap_or("").to_string();
        if current
            .split(SEARCH_SEPARATOR)
            .any(|entry| entry.trim_end_matches('/') == dir.trim_end_matches('/'))
        {
            return false;
        }

        let sep = SEARCH_SEPARATOR;
        let value = if current.is_empty() {
            format!(".{sep}{dir}//{sep}")
        } else {
            format!(".{sep}{dir}//{sep}{current}")
        };
        info!(texinputs = %value, "registered package directory");
        self.set("TEXINPUTS", value);
        true
    }

    /// Point `LIBGS` at the first Ghostscript library that exists
    pub fn detect_libgs(&mut self, candidates: &[&str]) -> Option<PathBuf> {
        if self.get("LIBGS").is_some() {
            return None;
        }
        let found = candidates.iter().map(PathBuf::from).find(|p| p.is_file())?;
        self.set("LIBGS", found.to_string_lossy());
        info!(libgs = %found.display(), "LIBGS set");
        Some(found)
    }
}
