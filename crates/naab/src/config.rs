use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{CodeCache, DEFAULT_CACHE_LIMIT};
use crate::heap::DEFAULT_GC_THRESHOLD;
use crate::polyglot::DEFAULT_TIMEOUT_MS;

/// Interpreter configuration, normally sourced from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Allocations between GC cycles (`NAAB_GC_THRESHOLD`).
    pub gc_threshold: usize,
    /// Per-block foreign execution budget (`NAAB_POLYGLOT_TIMEOUT_MS`).
    pub timeout: Duration,
    /// Inline-code cache root (`NAAB_CACHE_DIR`); `None` disables caching.
    pub cache_root: Option<PathBuf>,
    /// Cache eviction ceiling (`NAAB_CACHE_LIMIT_BYTES`).
    pub cache_limit: u64,
    /// Module search roots (`NAAB_MODULE_PATH`, colon-separated).
    pub module_paths: Vec<PathBuf>,
    /// ANSI colors in error reports (`NAAB_COLOR=0` disables).
    pub color: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            cache_root: None,
            cache_limit: DEFAULT_CACHE_LIMIT,
            module_paths: Vec::new(),
            color: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl Config {
    /// Reads the `NAAB_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let module_paths = std::env::var_os("NAAB_MODULE_PATH")
            .map(|raw| std::env::split_paths(&raw).collect())
            .unwrap_or_default();
        Self {
            gc_threshold: env_parse("NAAB_GC_THRESHOLD").unwrap_or(DEFAULT_GC_THRESHOLD),
            timeout: Duration::from_millis(
                env_parse("NAAB_POLYGLOT_TIMEOUT_MS").unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            cache_root: CodeCache::default_root(),
            cache_limit: env_parse("NAAB_CACHE_LIMIT_BYTES").unwrap_or(DEFAULT_CACHE_LIMIT),
            module_paths,
            color: std::env::var("NAAB_COLOR").map_or(true, |v| v != "0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn env_overrides_are_honored() {
        std::env::set_var("NAAB_GC_THRESHOLD", "250");
        std::env::set_var("NAAB_POLYGLOT_TIMEOUT_MS", "1500");
        std::env::set_var("NAAB_COLOR", "0");
        let config = Config::from_env();
        std::env::remove_var("NAAB_GC_THRESHOLD");
        std::env::remove_var("NAAB_POLYGLOT_TIMEOUT_MS");
        std::env::remove_var("NAAB_COLOR");
        assert_eq!(config.gc_threshold, 250);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert!(!config.color);
    }

    #[test]
    #[serial]
    fn module_path_splits_on_separators() {
        std::env::set_var("NAAB_MODULE_PATH", "/tmp/a:/tmp/b");
        let config = Config::from_env();
        std::env::remove_var("NAAB_MODULE_PATH");
        assert_eq!(
            config.module_paths,
            vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        std::env::remove_var("NAAB_GC_THRESHOLD");
        std::env::remove_var("NAAB_COLOR");
        let config = Config::from_env();
        assert_eq!(config.gc_threshold, DEFAULT_GC_THRESHOLD);
        assert!(config.color);
    }
}
