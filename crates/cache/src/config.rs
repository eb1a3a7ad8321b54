//! Cache configuration
//!
//! Sizes are expressed in megabytes. Values come from defaults, a TOML table
//! and `QUIRE_*` environment variables, in that order of precedence (later
//! wins).

use crate::memory_budget::MemoryTrackerConfig;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const MB: usize = 1024 * 1024;

pub const ENV_RAM_CACHE_MB: &str = "QUIRE_RAM_CACHE_MB";
pub const ENV_POOL_MB: &str = "QUIRE_POOL_MB";
pub const ENV_DISK_CACHE_MB: &str = "QUIRE_DISK_CACHE_MB";
pub const ENV_CACHE_DIR: &str = "QUIRE_CACHE_DIR";

/// Errors that can occur while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Read and parse an environment variable, if set
pub fn env_override<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Budgets and locations for the bitmap cache tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// In-memory cache budget
    pub ram_cache_mb: usize,
    /// Bytes the buffer pool may retain
    pub pool_mb: usize,
    /// Disk overflow store budget
    pub disk_cache_mb: usize,
    /// Base directory for on-disk caches
    pub cache_dir: PathBuf,
    /// Whether the disk overflow store is used at all
    pub disk_enabled: bool,
    /// While the disk fallback is active, the memory budget is divided by this
    pub fallback_divisor: usize,
    /// Total bitmap memory the tracker measures levels against
    pub memory_budget_mb: usize,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ram_cache_mb: 256,
            pool_mb: 64,
            disk_cache_mb: 1024,
            cache_dir: Self::default_cache_dir(),
            disk_enabled: true,
            fallback_divisor: 4,
            memory_budget_mb: 512,
            warning_threshold: 0.85,
            critical_threshold: 0.95,
        }
    }
}

impl CacheConfig {
    /// Platform cache directory, e.g. `~/.cache/quire` on Linux
    pub fn default_cache_dir() -> PathBuf {
        match dirs::cache_dir() {
            Some(dir) => dir.join("quire"),
            None => PathBuf::from(".quire-cache"),
        }
    }

    pub fn with_ram_mb(mut self, mb: usize) -> Self {
        self.ram_cache_mb = mb;
        self
    }

    pub fn with_pool_mb(mut self, mb: usize) -> Self {
        self.pool_mb = mb;
        self
    }

    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_mb = mb;
        self
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn ram_cache_bytes(&self) -> usize {
        self.ram_cache_mb.saturating_mul(MB)
    }

    pub fn pool_bytes(&self) -> usize {
        self.pool_mb.saturating_mul(MB)
    }

    pub fn disk_cache_bytes(&self) -> u64 {
        (self.disk_cache_mb as u64).saturating_mul(MB as u64)
    }

    /// Where rendered bitmaps overflow to
    pub fn bitmap_dir(&self) -> PathBuf {
        self.cache_dir.join("bitmaps")
    }

    /// Where repaired documents are kept
    pub fn repaired_dir(&self) -> PathBuf {
        self.cache_dir.join("repaired")
    }

    /// Where remote documents are downloaded to
    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir.join("staging")
    }

    pub fn tracker_config(&self) -> MemoryTrackerConfig {
        MemoryTrackerConfig::new(self.memory_budget_mb.saturating_mul(MB))
            .with_warning_threshold(self.warning_threshold)
            .with_critical_threshold(self.critical_threshold)
    }

    /// Overlay `QUIRE_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(mb) = env_override(ENV_RAM_CACHE_MB)? {
            self.ram_cache_mb = mb;
        }
        if let Some(mb) = env_override(ENV_POOL_MB)? {
            self.pool_mb = mb;
        }
        if let Some(mb) = env_override(ENV_DISK_CACHE_MB)? {
            self.disk_cache_mb = mb;
        }
        if let Some(dir) = env_override::<PathBuf>(ENV_CACHE_DIR)? {
            self.cache_dir = dir;
        }
        Ok(())
    }

    /// Defaults overlaid with the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Check values the cache cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback_divisor == 0 {
            return Err(ConfigError::InvalidValue {
                key: "fallback_divisor".to_string(),
                value: "0".to_string(),
            });
        }
        if self.warning_threshold > self.critical_threshold {
            return Err(ConfigError::InvalidValue {
                key: "warning_threshold".to_string(),
                value: self.warning_threshold.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.ram_cache_bytes(), 256 * MB);
        assert_eq!(config.pool_bytes(), 64 * MB);
        assert_eq!(config.disk_cache_bytes(), 1024 * MB as u64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_ram_mb(32)
            .with_pool_mb(8)
            .with_disk_mb(64)
            .with_cache_dir("/custom/path");

        assert_eq!(config.ram_cache_bytes(), 32 * MB);
        assert_eq!(config.pool_bytes(), 8 * MB);
        assert_eq!(config.bitmap_dir(), PathBuf::from("/custom/path/bitmaps"));
        assert_eq!(config.staging_dir(), PathBuf::from("/custom/path/staging"));
    }

    #[test]
    fn test_validate_rejects_zero_divisor() {
        let config = CacheConfig {
            fallback_divisor: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_toml_partial() {
        let config: CacheConfig = toml::from_str("ram_cache_mb = 128\n").unwrap();
        assert_eq!(config.ram_cache_mb, 128);
        assert_eq!(config.pool_mb, 64);
        assert!(config.disk_enabled);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CacheConfig::default()
            .with_ram_mb(12)
            .with_cache_dir("/tmp/quire-test");
        let text = toml::to_string(&config).unwrap();
        let parsed: CacheConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&[ENV_RAM_CACHE_MB, ENV_POOL_MB, ENV_DISK_CACHE_MB, ENV_CACHE_DIR]);

        env::set_var(ENV_RAM_CACHE_MB, "128");
        env::set_var(ENV_POOL_MB, "16");
        env::set_var(ENV_DISK_CACHE_MB, "512");
        env::set_var(ENV_CACHE_DIR, "/tmp/test-cache");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.ram_cache_mb, 128);
        assert_eq!(config.pool_mb, 16);
        assert_eq!(config.disk_cache_mb, 512);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/test-cache"));
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&[ENV_RAM_CACHE_MB, ENV_POOL_MB, ENV_DISK_CACHE_MB, ENV_CACHE_DIR]);

        env::remove_var(ENV_POOL_MB);
        env::remove_var(ENV_DISK_CACHE_MB);
        env::remove_var(ENV_CACHE_DIR);
        env::set_var(ENV_RAM_CACHE_MB, " 96 ");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.ram_cache_mb, 96);
        assert_eq!(config.pool_mb, 64);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&[ENV_RAM_CACHE_MB]);

        env::set_var(ENV_RAM_CACHE_MB, "not_a_number");
        let err = CacheConfig::from_env().unwrap_err();
        assert!(err.to_string().contains(ENV_RAM_CACHE_MB));
    }

    // Saves and restores environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }
}
