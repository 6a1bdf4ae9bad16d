//! Executable lookup across host layouts
//!
//! TeX distributions land in very different places depending on how they
//! were installed (system packages, TeX Live installer, MacTeX, container
//! images). Lookup checks the search path first, then a fixed list of known
//! installation directories. An unresolved name is returned unchanged so a
//! later spawn fails with a clear "not found".

use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const PLATFORM_TEX_DIRS: &[&str] = &[
    "/Library/TeX/texbin",
    "/usr/local/texlive/2025/bin/universal-darwin",
    "/usr/local/texlive/2025/bin/x86_64-darwin",
    "/usr/local/texlive/2025/bin/aarch64-darwin",
    "/usr/local/texlive/2024/bin/universal-darwin",
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
];

#[cfg(not(target_os = "macos"))]
const PLATFORM_TEX_DIRS: &[&str] = &[
    "/usr/local/texlive/2025/bin/x86_64-linux",
    "/usr/local/texlive/2025/bin/aarch64-linux",
    "/usr/local/texlive/2024/bin/x86_64-linux",
    "/usr/local/texlive/2024/bin/aarch64-linux",
    "/opt/texlive/bin/x86_64-linux",
    "/opt/texlive/bin/aarch64-linux",
    "/usr/local/bin",
    "/usr/bin",
];

/// Resolves executable names to absolute paths
#[derive(Debug, Clone)]
pub struct CommandLocator {
    search_path: Option<OsString>,
    known_dirs: Vec<PathBuf>,
}

impl Default for CommandLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLocator {
    /// Locator using the process `PATH` and the platform's known TeX directories
    pub fn new() -> Self {
        Self {
            search_path: std::env::var_os("PATH"),
            known_dirs: PLATFORM_TEX_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Locator with an explicit search path and directory list
    pub fn with_dirs(search_path: Option<OsString>, known_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_path,
            known_dirs,
        }
    }

    /// Known installation directories that exist on this host
    pub fn existing_known_dirs(&self) -> Vec<PathBuf> {
        self.known_dirs.iter().filter(|d| d.is_dir()).cloned().collect()
    }

    /// Absolute path of `name`, or `name` itself when nothing matches
    pub fn resolve(&self, name: &str) -> PathBuf {
        let file_name = format!("{name}{}", std::env::consts::EXE_SUFFIX);

        let from_search_path = self
            .search_path
            .as_ref()
            .into_iter()
            .flat_map(std::env::split_paths)
            .map(|dir| dir.join(&file_name))
            .find(|candidate| is_executable(candidate));
        if let Some(found) = from_search_path {
            return found;
        }

        self.known_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| is_executable(candidate))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

/// Whether `path` names a runnable file
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn test_unresolved_name_is_returned_unchanged() {
        let locator = CommandLocator::with_dirs(None, vec![PathBuf::from("/no/such/dir")]);
        assert_eq!(locator.resolve("pdflatex"), PathBuf::from("pdflatex"));
    }

    #[cfg(unix)]
    #[test]
    fn test_search_path_wins_over_known_dirs() {
        let on_path = TempDir::new().unwrap();
        let known = TempDir::new().unwrap();
        let expected = touch_executable(on_path.path(), "xelatex");
        touch_executable(known.path(), "xelatex");

        let locator = CommandLocator::with_dirs(
            Some(on_path.path().as_os_str().to_owned()),
            vec![known.path().to_path_buf()],
        );
        assert_eq!(locator.resolve("xelatex"), expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_known_dirs_checked_in_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        touch_executable(second.path(), "lualatex");
        let expected = touch_executable(first.path(), "lualatex");

        let locator = CommandLocator::with_dirs(
            None,
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
        );
        assert_eq!(locator.resolve("lualatex"), expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pdflatex"), b"").unwrap();

        let locator = CommandLocator::with_dirs(None, vec![dir.path().to_path_buf()]);
        assert_eq!(locator.resolve("pdflatex"), PathBuf::from("pdflatex"));
    }

    #[test]
    fn test_existing_known_dirs() {
        let dir = TempDir::new().unwrap();
        let locator = CommandLocator::with_dirs(
            None,
            vec![PathBuf::from("/no/such/dir"), dir.path().to_path_buf()],
        );
        assert_eq!(locator.existing_known_dirs(), vec![dir.path().to_path_buf()]);
    }
}
