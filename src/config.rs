//! Engine configuration.
//!
//! Layered, later layers win:
//! 1. built-in defaults
//! 2. JSON config file (`$XDG_CONFIG_HOME/debrew/config.json`, or `--config`)
//! 3. environment (`DEBREW_*`, `SOURCE_DATE_EPOCH`)
//! 4. command-line flags, applied by the binary

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared download cache, keyed by URL and checksum.
    pub cache_dir: PathBuf,
    /// Parent of the per-run build contexts.
    pub work_dir: PathBuf,
    /// Where finished `.deb` files land.
    pub output_dir: PathBuf,
    /// Install prefix inside the package, e.g. `/usr/local`.
    pub install_prefix: PathBuf,
    /// Concurrent formula pipelines.
    pub jobs: usize,
    /// Keep build contexts after the run instead of deleting them.
    pub keep_work: bool,
    /// `Maintainer:` for formulas that do not name one.
    pub maintainer: String,
    /// Retries after a transient fetch failure.
    pub fetch_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_backoff_ms: u64,
    pub fetch_timeout_secs: u64,
    pub step_timeout_secs: u64,
    /// mtime stamped on every archive member.
    pub source_date_epoch: u64,
    /// GitHub REST API root used by `debrew update`.
    pub github_api_url: String,
    /// Go release index (`?mode=json` shape).
    pub golang_index_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: cache_dir(),
            work_dir: std::env::temp_dir().join("debrew"),
            output_dir: PathBuf::from("."),
            install_prefix: PathBuf::from("/usr/local"),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            keep_work: false,
            maintainer: "debrew <debrew@localhost>".to_string(),
            fetch_retries: 3,
            retry_backoff_ms: 500,
            fetch_timeout_secs: 600,
            step_timeout_secs: 3600,
            source_date_epoch: 0,
            github_api_url: "https://api.github.com".to_string(),
            golang_index_url: "https://golang.org/dl/?mode=json".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the config file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.map(Path::to_path_buf).unwrap_or_else(config_path);

        let mut config = if file.exists() {
            debug!(path = %file.display(), "loading config file");
            let contents = std::fs::read_to_string(&file)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Override fields from `DEBREW_*` variables and `SOURCE_DATE_EPOCH`.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("DEBREW_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("DEBREW_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("DEBREW_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = var("DEBREW_INSTALL_PREFIX") {
            self.install_prefix = PathBuf::from(prefix);
        }
        if let Some(maintainer) = var("DEBREW_MAINTAINER") {
            self.maintainer = maintainer;
        }
        if let Some(url) = var("DEBREW_GITHUB_API_URL") {
            self.github_api_url = url;
        }
        if let Some(url) = var("DEBREW_GOLANG_INDEX_URL") {
            self.golang_index_url = url;
        }
        if let Some(jobs) = var("DEBREW_JOBS") {
            match jobs.parse::<usize>() {
                Ok(n) if n > 0 => self.jobs = n,
                _ => warn!(value = %jobs, "ignoring invalid DEBREW_JOBS"),
            }
        }
        if let Some(epoch) = var("SOURCE_DATE_EPOCH") {
            match epoch.parse::<u64>() {
                Ok(secs) => self.source_date_epoch = secs,
                Err(_) => warn!(value = %epoch, "ignoring invalid SOURCE_DATE_EPOCH"),
            }
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Get the cache directory (~/.cache/debrew/ or equivalent)
pub fn cache_dir() -> PathBuf {
    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("debrew")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/debrew")
    } else {
        PathBuf::from(".cache/debrew")
    }
}

/// Default config file location (~/.config/debrew/config.json or equivalent)
pub fn config_path() -> PathBuf {
    if let Some(config_home) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config_home).join("debrew/config.json")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config/debrew/config.json")
    } else {
        PathBuf::from(".config/debrew/config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.cache_dir.ends_with("debrew"));
        assert_eq!(config.install_prefix, PathBuf::from("/usr/local"));
        assert!(config.jobs >= 1);
        assert_eq!(config.fetch_retries, 3);
        assert_eq!(config.retry_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DEBREW_JOBS", "2"),
            ("DEBREW_INSTALL_PREFIX", "/usr"),
            ("SOURCE_DATE_EPOCH", "1600000000"),
            ("DEBREW_GITHUB_API_URL", "http://127.0.0.1:8080"),
        ]);
        let mut config = Config::default();
        config.apply_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.jobs, 2);
        assert_eq!(config.install_prefix, PathBuf::from("/usr"));
        assert_eq!(config.source_date_epoch, 1_600_000_000);
        assert_eq!(config.github_api_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn test_invalid_env_is_ignored() {
        let mut config = Config::default();
        let jobs = config.jobs;
        config.apply_vars(|k| (k == "DEBREW_JOBS").then(|| "zero".to_string()));
        assert_eq!(config.jobs, jobs);
    }

    #[test]
    fn test_partial_config_file() {
        let config: Config = serde_json::from_str(r#"{"jobs": 7, "keep_work": true}"#).unwrap();
        assert_eq!(config.jobs, 7);
        assert!(config.keep_work);
        assert_eq!(config.fetch_retries, 3);
    }
}
