//! Viewer configuration
//!
//! One TOML document with a table per concern:
//!
//! ```toml
//! [cache]
//! ram_cache_mb = 256
//!
//! [repair]
//! branching_factor = 32
//!
//! [render]
//! max_dimension = 8192
//!
//! [session]
//! allowed_schemes = ["file", "content", "https"]
//! ```
//!
//! Missing keys take their defaults; `QUIRE_*` environment variables win over
//! the file.

use quire_cache::{env_override, CacheConfig, ConfigError, QualityProfile};
use quire_repair::RepairConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_MAX_DIMENSION: &str = "QUIRE_MAX_DIMENSION";
pub const ENV_RENDER_TIMEOUT_MS: &str = "QUIRE_RENDER_TIMEOUT_MS";

const MB: u64 = 1024 * 1024;

/// Render pipeline limits and heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Hard cap on either side of a rendered bitmap, in pixels
    pub max_dimension: u32,
    /// Watchdog timeout for a single render without progress
    pub render_timeout_ms: u64,
    /// Consecutive failures after which a page is latched malformed
    pub malformed_threshold: u32,
    /// Renderer error texts that latch a page on the first failure
    pub malformed_patterns: Vec<String>,
    /// Fill color of the placeholder shown for malformed pages
    pub placeholder_rgba: [u8; 4],
    /// Pages on each side of the current one that `prefetch` renders
    pub prefetch_radius: u32,
    pub thumbnail_quality: QualityProfile,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_dimension: 8192,
            render_timeout_ms: 15_000,
            malformed_threshold: 2,
            malformed_patterns: vec![
                r"(?i)malformed".to_owned(),
                r"(?i)unresolvable".to_owned(),
                r"(?i)corrupt".to_owned(),
                r"(?i)invalid (content|stream|xref)".to_owned(),
            ],
            placeholder_rgba: [232, 232, 232, 255],
            prefetch_radius: 2,
            thumbnail_quality: QualityProfile::LowMemory,
        }
    }
}

impl RenderConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }
}

/// Source validation and open supervision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub allowed_schemes: Vec<String>,
    /// MIME types accepted when a source declares or implies one
    pub allowed_mime_types: Vec<String>,
    pub max_document_mb: u64,
    /// Watchdog timeout for an open without progress
    pub open_timeout_ms: u64,
    /// Bytes copied between cancellation checks while staging a download
    pub download_chunk_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["file".to_owned(), "content".to_owned(), "https".to_owned()],
            allowed_mime_types: vec!["application/pdf".to_owned(), "application/x-pdf".to_owned()],
            max_document_mb: 2048,
            open_timeout_ms: 60_000,
            download_chunk_bytes: 64 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn max_document_bytes(&self) -> u64 {
        self.max_document_mb.saturating_mul(MB)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn allows_scheme(&self, scheme: &str) -> bool {
        self.allowed_schemes
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(scheme))
    }

    pub fn allows_mime(&self, mime: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }
}

/// Complete viewer configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub cache: CacheConfig,
    pub repair: RepairConfig,
    pub render: RenderConfig,
    pub session: SessionConfig,
}

impl ViewerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// File (or defaults), then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.cache.apply_env()?;
        if let Some(max) = env_override(ENV_MAX_DIMENSION)? {
            self.render.max_dimension = max;
        }
        if let Some(ms) = env_override(ENV_RENDER_TIMEOUT_MS)? {
            self.render.render_timeout_ms = ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.repair.validate().map_err(|err| invalid("repair", err))?;

        if self.render.max_dimension == 0 {
            return Err(invalid("render.max_dimension", 0));
        }
        if self.render.malformed_threshold == 0 {
            return Err(invalid("render.malformed_threshold", 0));
        }
        if self.render.render_timeout_ms == 0 {
            return Err(invalid("render.render_timeout_ms", 0));
        }
        regex::RegexSet::new(&self.render.malformed_patterns)
            .map_err(|err| invalid("render.malformed_patterns", err))?;

        if self.session.open_timeout_ms == 0 {
            return Err(invalid("session.open_timeout_ms", 0));
        }
        if self.session.download_chunk_bytes == 0 {
            return Err(invalid("session.download_chunk_bytes", 0));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_defaults_are_valid() {
        let config = ViewerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.render.malformed_threshold, 2);
        assert_eq!(config.repair.branching_factor, 32);
        assert!(config.session.allows_scheme("HTTPS"));
        assert!(!config.session.allows_scheme("ftp"));
    }

    #[test]
    fn test_partial_toml() {
        let config = ViewerConfig::from_toml_str(
            "[render]\nmax_dimension = 4096\n\n[cache]\nram_cache_mb = 32\n",
        )
        .unwrap();

        assert_eq!(config.render.max_dimension, 4096);
        assert_eq!(config.render.malformed_threshold, 2);
        assert_eq!(config.cache.ram_cache_mb, 32);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = ViewerConfig::default();
        config.render.thumbnail_quality = QualityProfile::Balanced;
        config.session.max_document_mb = 10;

        let text = config.to_toml_string().unwrap();
        assert_eq!(ViewerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quire.toml");
        fs::write(&path, "[repair]\nbranching_factor = 8\n").unwrap();

        let config = ViewerConfig::from_file(&path).unwrap();
        assert_eq!(config.repair.branching_factor, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ViewerConfig::default();
        config.render.max_dimension = 0;
        assert!(config.validate().is_err());

        let mut config = ViewerConfig::default();
        config.repair.branching_factor = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("repair"));

        let mut config = ViewerConfig::default();
        config.render.malformed_patterns = vec!["(".to_owned()];
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let _guard = EnvGuard::new(&[ENV_MAX_DIMENSION, ENV_RENDER_TIMEOUT_MS]);
        env::set_var(ENV_MAX_DIMENSION, "2048");
        env::set_var(ENV_RENDER_TIMEOUT_MS, "500");

        let config = ViewerConfig::load(None).unwrap();
        assert_eq!(config.render.max_dimension, 2048);
        assert_eq!(config.render.render_timeout(), Duration::from_millis(500));
    }

    #[test]
    #[serial]
    fn test_env_invalid() {
        let _guard = EnvGuard::new(&[ENV_MAX_DIMENSION]);
        env::set_var(ENV_MAX_DIMENSION, "huge");

        let err = ViewerConfig::load(None).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_DIMENSION));
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
