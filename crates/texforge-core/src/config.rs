//! Service settings
//!
//! Layered once at startup: built-in defaults, then an optional TOML file,
//! then environment variables. There is no reload.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::CompileLimits;
use crate::error::ConfigError;
use crate::probe::DEFAULT_SEARCH_ROOTS;

/// Top-level settings structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Concurrent engine processes; 0 is treated as 1
    pub max_concurrent_compiles: usize,
    /// Wall-clock budget per engine run
    pub compile_timeout_secs: u64,
    /// Extra budget for engines not yet verified
    pub cold_cache_extra_secs: u64,
    /// Address-space ceiling per engine process; 0 disables it
    pub memory_limit_mb: u64,
    /// How long a request waits for warmup
    pub warmup_wait_ms: u64,
    /// Serif CJK family, bypassing detection
    pub cjk_main_font: Option<String>,
    /// Sans CJK family, bypassing detection
    pub cjk_sans_font: Option<String>,
    /// Consecutive failures before an engine is tripped; 0 disables
    pub breaker_threshold: u32,
    /// How long a tripped engine stays ranked last
    pub breaker_cooldown_secs: u64,
    /// Cached block previews
    pub preview_cache_entries: usize,
    /// Roots searched for packages the database cannot find
    pub package_search_roots: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_compiles: 2,
            compile_timeout_secs: 30,
            cold_cache_extra_secs: 20,
            memory_limit_mb: 1536,
            warmup_wait_ms: 3000,
            cjk_main_font: None,
            cjk_sans_font: None,
            breaker_threshold: 3,
            breaker_cooldown_secs: 300,
            preview_cache_entries: 128,
            package_search_roots: DEFAULT_SEARCH_ROOTS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl Settings {
    /// Parse settings from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Override fields from environment variables read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MAX_CONCURRENT_COMPILES") {
            self.max_concurrent_compiles = parse("MAX_CONCURRENT_COMPILES", &v)?;
        }
        if let Some(v) = get("COMPILE_TIMEOUT_SECONDS") {
            self.compile_timeout_secs = parse("COMPILE_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("COLD_CACHE_EXTRA_SECONDS") {
            self.cold_cache_extra_secs = parse("COLD_CACHE_EXTRA_SECONDS", &v)?;
        }
        if let Some(v) = get("COMPILE_MEM_LIMIT_MB") {
            self.memory_limit_mb = parse("COMPILE_MEM_LIMIT_MB", &v)?;
        }
        if let Some(v) = get("WARMUP_WAIT_MS") {
            self.warmup_wait_ms = parse("WARMUP_WAIT_MS", &v)?;
        }
        if let Some(v) = get("CJK_MAIN_FONT") {
            self.cjk_main_font = Some(v.trim().to_string());
        }
        if let Some(v) = get("CJK_SANS_FONT") {
            self.cjk_sans_font = Some(v.trim().to_string());
        }
        if let Some(v) = get("ENGINE_BREAKER_THRESHOLD") {
            self.breaker_threshold = parse("ENGINE_BREAKER_THRESHOLD", &v)?;
        }
        if let Some(v) = get("ENGINE_BREAKER_COOLDOWN_SECONDS") {
            self.breaker_cooldown_secs = parse("ENGINE_BREAKER_COOLDOWN_SECONDS", &v)?;
        }
        if let Some(v) = get("PREVIEW_CACHE_ENTRIES") {
            self.preview_cache_entries = parse("PREVIEW_CACHE_ENTRIES", &v)?;
        }
        Ok(())
    }

    /// Size of the concurrency gate
    pub fn gate_size(&self) -> usize {
        self.max_concurrent_compiles.max(1)
    }

    /// Memory ceiling in bytes, if enabled
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb.saturating_mul(1024 * 1024))
    }

    /// Budgets handed to the compilation driver
    pub fn compile_limits(&self) -> CompileLimits {
        CompileLimits {
            timeout: Duration::from_secs(self.compile_timeout_secs),
            cold_extra: Duration::from_secs(self.cold_cache_extra_secs),
            memory_limit: self.memory_limit_bytes(),
            warmup_wait: Duration::from_millis(self.warmup_wait_ms),
        }
    }

    /// Cooldown of a tripped engine
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent_compiles, 2);
        assert_eq!(settings.compile_timeout_secs, 30);
        assert_eq!(settings.memory_limit_bytes(), Some(1536 * 1024 * 1024));
        assert_eq!(settings.compile_limits().warmup_wait, Duration::from_secs(3));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str("max_concurrent_compiles = 1\ncjk_main_font = \"IPAexMincho\"\n").unwrap();
        assert_eq!(settings.max_concurrent_compiles, 1);
        assert_eq!(settings.cjk_main_font.as_deref(), Some("IPAexMincho"));
        assert_eq!(settings.breaker_threshold, 3);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut settings = Settings::from_toml_str("compile_timeout_secs = 60").unwrap();
        settings
            .apply_env(env(&[
                ("COMPILE_TIMEOUT_SECONDS", "45"),
                ("COMPILE_MEM_LIMIT_MB", "0"),
                ("CJK_SANS_FONT", " Noto Sans CJK JP "),
                ("WARMUP_WAIT_MS", ""),
            ]))
            .unwrap();
        assert_eq!(settings.compile_timeout_secs, 45);
        assert_eq!(settings.memory_limit_bytes(), None);
        assert_eq!(settings.cjk_sans_font.as_deref(), Some("Noto Sans CJK JP"));
        assert_eq!(settings.warmup_wait_ms, 3000);
    }

    #[test]
    fn test_invalid_number_names_key() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("MAX_CONCURRENT_COMPILES", "two")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "MAX_CONCURRENT_COMPILES");
                assert_eq!(value, "two");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[("MAX_CONCURRENT_COMPILES", "0")])).unwrap();
        assert_eq!(settings.gate_size(), 1);
    }

    #[test]
    fn test_bad_toml() {
        assert!(Settings::from_toml_str("max_concurrent_compiles = \"many\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("texforge.toml");
        std::fs::write(&path, "preview_cache_entries = 16\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.preview_cache_entries, 16);
    }
}
