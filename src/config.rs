// ⚙️ Loader configuration
//
// Priority: CLI flag > environment > TOML file > default.
// The binary resolves flags and environment with clap and hands them over as
// `ConfigOverrides`; everything below that is plain serde.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::store::StoreLimits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// XML feed to load
    pub source_path: PathBuf,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Scan the whole feed for bad records before loading anything
    pub validate_first: bool,

    pub batch_size: usize,

    /// Batches the store holds before the reader blocks
    pub batch_capacity: usize,

    /// Consecutive delivery attempts per batch
    pub attempts: usize,

    /// Error events tolerated before the run is force-stopped
    pub error_threshold: usize,

    /// Desired writer threads, clamped by available parallelism
    pub threads: usize,

    pub poll_interval_ms: u64,
    pub writer_stagger_ms: u64,
    pub gateway_timeout_ms: u64,

    /// Default tracing filter; RUST_LOG wins when set
    pub log_level: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            source_path: PathBuf::from("transactions.xml"),
            database_path: PathBuf::from("transactions.db"),
            validate_first: true,
            batch_size: 150,
            batch_capacity: 100,
            attempts: 3,
            error_threshold: 100,
            threads: 4,
            poll_interval_ms: 100,
            writer_stagger_ms: 1000,
            gateway_timeout_ms: 4000,
            log_level: "info".to_string(),
        }
    }
}

/// Values that take precedence over the file, `None` = keep
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub source_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub validate_first: Option<bool>,
    pub batch_size: Option<usize>,
    pub batch_capacity: Option<usize>,
    pub attempts: Option<usize>,
    pub error_threshold: Option<usize>,
    pub threads: Option<usize>,
    pub log_level: Option<String>,
}

impl LoaderConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| IngestError::Config(format!("Parse TOML failed: {}", e)))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("Read {} failed: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// File if given, defaults otherwise, then overrides on top
    pub fn resolve(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(value) = overrides.source_path {
            self.source_path = value;
        }
        if let Some(value) = overrides.database_path {
            self.database_path = value;
        }
        if let Some(value) = overrides.validate_first {
            self.validate_first = value;
        }
        if let Some(value) = overrides.batch_size {
            self.batch_size = value;
        }
        if let Some(value) = overrides.batch_capacity {
            self.batch_capacity = value;
        }
        if let Some(value) = overrides.attempts {
            self.attempts = value;
        }
        if let Some(value) = overrides.error_threshold {
            self.error_threshold = value;
        }
        if let Some(value) = overrides.threads {
            self.threads = value;
        }
        if let Some(value) = overrides.log_level {
            self.log_level = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_path.as_os_str().is_empty() {
            return Err(IngestError::Config("source_path must not be empty".to_string()));
        }

        let positive = [
            ("batch_size", self.batch_size as u64),
            ("batch_capacity", self.batch_capacity as u64),
            ("attempts", self.attempts as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("gateway_timeout_ms", self.gateway_timeout_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(IngestError::Config(format!("{} must be greater than 0", key)));
            }
        }

        Ok(())
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            batch_size: self.batch_size,
            max_batches: self.batch_capacity,
            error_threshold: self.error_threshold,
            poll_interval: self.poll_interval(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn writer_stagger(&self) -> Duration {
        Duration::from_millis(self.writer_stagger_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LoaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_limits().capacity(), 15_000);
        assert_eq!(config.gateway_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LoaderConfig::from_toml_str(
            r#"
            source_path = "feeds/big.xml"
            batch_size = 50
            validate_first = false
            "#,
        )
        .unwrap();

        assert_eq!(config.source_path, PathBuf::from("feeds/big.xml"));
        assert_eq!(config.batch_size, 50);
        assert!(!config.validate_first);
        assert_eq!(config.attempts, 3);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = LoaderConfig::from_toml_str("bach_size = 10").unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_size = 50\nthreads = 8").unwrap();

        let config = LoaderConfig::resolve(
            Some(file.path()),
            ConfigOverrides {
                batch_size: Some(20),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.batch_size, 20);
        assert_eq!(config.threads, 8);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        for overrides in [
            ConfigOverrides {
                batch_size: Some(0),
                ..Default::default()
            },
            ConfigOverrides {
                attempts: Some(0),
                ..Default::default()
            },
            ConfigOverrides {
                batch_capacity: Some(0),
                ..Default::default()
            },
            ConfigOverrides {
                source_path: Some(PathBuf::new()),
                ..Default::default()
            },
        ] {
            assert!(LoaderConfig::resolve(None, overrides).is_err());
        }
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = LoaderConfig::from_toml_file(Path::new("/nonexistent/loader.toml")).unwrap_err();
        assert!(err.to_string().contains("Read /nonexistent/loader.toml failed"));
    }
}
