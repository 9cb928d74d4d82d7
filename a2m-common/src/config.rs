//! Bootstrap configuration
//!
//! Configuration sources, highest priority first:
//! 1. `--config <path>` on the command line
//! 2. `A2M_CONFIG` environment variable
//! 3. `<platform config dir>/audio2midi/config.toml`
//! 4. Built-in defaults
//!
//! A missing file is never fatal: a warning is logged and defaults are used.
//! A file that exists but does not parse is a [`Error::Config`].
//! `A2M_ROOT_FOLDER` overrides `root_folder` from any source.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "A2M_CONFIG";

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV_VAR: &str = "A2M_ROOT_FOLDER";

const APP_DIR_NAME: &str = "audio2midi";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder for the database, uploads and outputs
    ///
    /// If not specified, the platform data directory is used.
    pub root_folder: Option<PathBuf>,

    /// SQLite database file (default `<root>/audio2midi.db`)
    pub database_path: Option<PathBuf>,

    /// Uploaded input files (default `<root>/uploads`)
    pub upload_dir: Option<PathBuf>,

    /// Generated MIDI files (default `<root>/outputs`)
    pub output_dir: Option<PathBuf>,

    pub logging: LoggingConfig,

    pub processing: ProcessingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Analysis and orchestration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Analysis sample rate in Hz
    pub sample_rate: u32,
    /// STFT hop length in samples
    pub hop_length: usize,
    /// STFT window length in samples
    pub n_fft: usize,
    /// Shortest accepted input, seconds
    pub min_duration: f64,
    /// Longest accepted input, seconds
    pub max_duration: f64,
    /// Admission ceiling for concurrently processing tasks
    pub max_concurrent_tasks: usize,
    /// Deadline used by the CLI for a single conversion
    pub processing_timeout_secs: u64,
    /// Age after which finished tasks are removed by cleanup
    pub cleanup_after_hours: u64,
    /// Quality score below which the pre-check warns
    pub quality_threshold: f64,
    /// Fail the task when the pre-check score is below `quality_threshold`
    pub enforce_quality_threshold: bool,
    /// Run the quality pre-check before the pipeline
    pub quality_precheck: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            hop_length: 512,
            n_fft: 2048,
            min_duration: 10.0,
            max_duration: 600.0,
            max_concurrent_tasks: 3,
            processing_timeout_secs: 300,
            cleanup_after_hours: 24,
            quality_threshold: 0.5,
            enforce_quality_threshold: false,
            quality_precheck: true,
        }
    }
}

impl ProcessingConfig {
    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".to_string()));
        }
        if self.hop_length == 0 || self.n_fft == 0 {
            return Err(Error::Config(
                "hop_length and n_fft must be positive".to_string(),
            ));
        }
        if self.hop_length > self.n_fft {
            return Err(Error::Config(format!(
                "hop_length ({}) must not exceed n_fft ({})",
                self.hop_length, self.n_fft
            )));
        }
        if !(self.min_duration >= 0.0) || !(self.max_duration > self.min_duration) {
            return Err(Error::Config(format!(
                "Duration bounds invalid: min {} / max {}",
                self.min_duration, self.max_duration
            )));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.processing_timeout_secs == 0 {
            return Err(Error::Config(
                "processing_timeout_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(Error::Config(format!(
                "quality_threshold must be within [0, 1], got {}",
                self.quality_threshold
            )));
        }
        Ok(())
    }
}

impl TomlConfig {
    /// Parse TOML text
    pub fn parse(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Read and parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let toml_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
        let config = Self::parse(&toml_str)?;
        info!("Loaded TOML configuration from {:?}", path);
        Ok(config)
    }

    /// Resolve and load configuration following the documented priority order,
    /// then apply the `A2M_ROOT_FOLDER` override and validate.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::locate(cli_path) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                warn!(
                    "Config file {:?} not found, using built-in defaults",
                    path
                );
                Self::default()
            }
            None => {
                debug!("No config file location available, using built-in defaults");
                Self::default()
            }
        };

        if let Ok(root) = std::env::var(ROOT_FOLDER_ENV_VAR) {
            if !root.is_empty() {
                debug!("Root folder overridden by {}: {}", ROOT_FOLDER_ENV_VAR, root);
                config.root_folder = Some(PathBuf::from(root));
            }
        }

        config.processing.validate()?;
        Ok(config)
    }

    /// Config file location by priority, whether or not it exists
    pub fn locate(cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_path {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join("config.toml"))
    }

    /// Root folder, falling back to the platform data directory
    pub fn root_folder(&self) -> PathBuf {
        self.root_folder.clone().unwrap_or_else(default_root_folder)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_under_root(self.database_path.as_deref(), "audio2midi.db")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.resolve_under_root(self.upload_dir.as_deref(), "uploads")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve_under_root(self.output_dir.as_deref(), "outputs")
    }

    // Relative paths are taken relative to the root folder
    fn resolve_under_root(&self, configured: Option<&Path>, default_name: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.root_folder().join(path),
            None => self.root_folder().join(default_name),
        }
    }
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("./a2m_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProcessingConfig::default();
        assert_eq!(config.sample_rate, 22050);
        assert_eq!(config.hop_length, 512);
        assert_eq!(config.n_fft, 2048);
        assert_eq!(config.max_concurrent_tasks, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = TomlConfig::parse(
            r#"
            root_folder = "/srv/a2m"

            [processing]
            max_concurrent_tasks = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.processing.max_concurrent_tasks, 5);
        assert_eq!(config.processing.sample_rate, 22050);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.database_path(), PathBuf::from("/srv/a2m/audio2midi.db"));
        assert_eq!(config.output_dir(), PathBuf::from("/srv/a2m/outputs"));
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let config = TomlConfig::parse(
            r#"
            root_folder = "/srv/a2m"
            upload_dir = "/mnt/incoming"
            output_dir = "midi"
            "#,
        )
        .unwrap();
        assert_eq!(config.upload_dir(), PathBuf::from("/mnt/incoming"));
        assert_eq!(config.output_dir(), PathBuf::from("/srv/a2m/midi"));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = TomlConfig::parse("processing = [not toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_durations() {
        let config = ProcessingConfig {
            min_duration: 30.0,
            max_duration: 10.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency_and_bad_threshold() {
        let zero = ProcessingConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let threshold = ProcessingConfig {
            quality_threshold: 1.5,
            ..Default::default()
        };
        assert!(threshold.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hop_longer_than_window() {
        let config = ProcessingConfig {
            hop_length: 4096,
            n_fft: 2048,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
