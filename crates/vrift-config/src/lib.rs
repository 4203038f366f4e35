//! # vrift-config
//!
//! Settings for the background worker pool and the directory cleaner.
//!
//! Resolution order: built-in defaults, then `~/.config/vrift/core.toml`,
//! then `VRIFT_*` environment variables.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const ENV_MAX_THREADS: &str = "VRIFT_POOL_MAX_THREADS";
pub const ENV_MAX_IDLE: &str = "VRIFT_POOL_MAX_IDLE";
pub const ENV_CLEANER_INTERVAL: &str = "VRIFT_CLEANER_INTERVAL_MS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on worker threads
    pub max_threads: usize,
    /// Idle workers kept alive between bursts
    pub max_idle: usize,
    /// Worker thread name prefix
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: num_cpus::get().max(1),
            max_idle: 2,
            name: "vrift-worker".to_string(),
        }
    }
}

/// Directory cleaner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Delay between periodic clean passes
    pub interval_ms: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub thread_pool: PoolConfig,
    pub cleaner: CleanerConfig,
}

impl CoreConfig {
    /// Parse a TOML file. Missing sections and keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded core config");
        Ok(config)
    }

    /// Like [`CoreConfig::load`] but never fails: problems are logged and
    /// the defaults are used instead.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Defaults, overlaid with the user config file and the environment.
    pub fn from_env() -> Self {
        let base = default_path()
            .map(|path| Self::load_or_default(&path))
            .unwrap_or_default();
        let mut config = base.clone();
        match config.apply_env(|key| std::env::var(key).ok()) {
            Ok(()) => config,
            Err(e) => {
                warn!(error = %e, "Ignoring environment overrides");
                base
            }
        }
    }

    /// Apply `VRIFT_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_THREADS) {
            self.thread_pool.max_threads = parse_number(ENV_MAX_THREADS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_IDLE) {
            self.thread_pool.max_idle = parse_number(ENV_MAX_IDLE, &value)?;
        }
        if let Some(value) = lookup(ENV_CLEANER_INTERVAL) {
            self.cleaner.interval_ms = parse_number(ENV_CLEANER_INTERVAL, &value)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_pool.max_threads == 0 {
            return Err(ConfigError::Invalid {
                key: "thread_pool.max_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.cleaner.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "cleaner.interval_ms".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("expected a non-negative integer, got {value:?}"),
    })
}

/// `<config dir>/vrift/core.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vrift").join("core.toml"))
}

static GLOBAL: OnceCell<CoreConfig> = OnceCell::new();

/// Process-wide config, resolved on first use.
pub fn global() -> &'static CoreConfig {
    GLOBAL.get_or_init(CoreConfig::from_env)
}

/// Install the process-wide config before anything reads it. Returns the
/// rejected config if [`global`] was already initialised.
pub fn set_global(config: CoreConfig) -> std::result::Result<(), CoreConfig> {
    GLOBAL.set(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core.toml");
        fs::write(&path, "[thread_pool]\nmax_threads = 3\n").unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.thread_pool.max_threads, 3);
        assert_eq!(config.thread_pool.max_idle, PoolConfig::default().max_idle);
        assert_eq!(config.cleaner, CleanerConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load_or_default(&dir.path().join("absent.toml"));
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core.toml");
        fs::write(&path, "[thread_pool\nmax_threads = ").unwrap();

        assert!(matches!(CoreConfig::load(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(CoreConfig::load_or_default(&path), CoreConfig::default());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core.toml");
        fs::write(&path, "[thread_pool]\nmax_threads = 0\n").unwrap();

        assert!(matches!(CoreConfig::load(&path), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_MAX_THREADS, "6"), (ENV_CLEANER_INTERVAL, " 250 ")]
            .into_iter()
            .collect();

        let mut config = CoreConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.thread_pool.max_threads, 6);
        assert_eq!(config.cleaner.interval_ms, 250);
    }

    #[test]
    fn test_env_garbage_rejected() {
        let mut config = CoreConfig::default();
        let err = config
            .apply_env(|key| (key == ENV_MAX_IDLE).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_IDLE));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = CoreConfig {
            thread_pool: PoolConfig {
                max_threads: 4,
                max_idle: 0,
                name: "gc".to_string(),
            },
            cleaner: CleanerConfig { interval_ms: 10 },
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(toml::from_str::<CoreConfig>(&text).unwrap(), config);
    }
}
