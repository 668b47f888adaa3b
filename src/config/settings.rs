//! Application settings structs, defaults, validation and TOML persistence.
//!
//! The settings are read once when a pipeline starts and passed down by
//! reference; nothing in the crate reads configuration from global state.
//! Every section is `#[serde(default)]` so a partial `settings.toml` fills
//! the missing keys from [`Default`], and [`AppConfig::validate`] runs on
//! every load so bad values fail at startup rather than mid-capture.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::paths::{self, AppPaths};
use crate::storage::{SampleEncoding, TimeComponent};

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors raised while loading, validating or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialise settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

/// Where and how segment files are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory holding the index and the recordings tree.  `None`
    /// means the platform data directory.
    pub root: Option<PathBuf>,
    /// Prepended to every segment filename.
    pub prefix: String,
    /// Sample encoding of the WAV files written by capture.
    pub encoding: SampleEncoding,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            prefix: String::new(),
            encoding: SampleEncoding::Float32,
        }
    }
}

// ---------------------------------------------------------------------------
// RotationConfig
// ---------------------------------------------------------------------------

/// Partitioning template; the finest component is the rotation period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub template: Vec<TimeComponent>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            template: vec![
                TimeComponent::Year,
                TimeComponent::Month,
                TimeComponent::Day,
                TimeComponent::Hour,
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Device selection and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name; `None` means the host default input.
    pub input_device: Option<String>,
    /// Output device name; `None` means the host default output.
    pub output_device: Option<String>,
    /// Capture sample rate in Hz; `None` uses the device default.
    pub sample_rate: Option<u32>,
    /// Number of interleaved channels captured (1 = mono).
    pub channels: u16,
    /// Frames per Audio Block exchanged with the device callback.
    pub block_frames: usize,
    /// Maximum number of blocks held by a pipeline queue.
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: None,
            channels: 1,
            block_frames: 1024,
            queue_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingConfig
// ---------------------------------------------------------------------------

/// Logging defaults applied when the CLI does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    /// Append log records to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Parsed [`log::LevelFilter`].  `validate` rejects unknown names, so
    /// the `Info` fallback only applies to unvalidated configs.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use panauricon::config::AppConfig;
///
/// // Load (returns Default when the file is missing)
/// let config = AppConfig::load().unwrap();
/// println!("recordings live under {}", config.storage_root().display());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application version tag written into every segment record.
    pub version: String,
    pub storage: StorageConfig,
    pub rotation: RotationConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").into(),
            storage: StorageConfig::default(),
            rotation: RotationConfig::default(),
            audio: AudioConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load and validate from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("config: {} missing, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::info!("config: loaded settings file {}", path.display());
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    /// Reject values the pipelines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.channels == 0 {
            return Err(invalid("audio.channels", "must be at least 1"));
        }
        if self.audio.block_frames == 0 {
            return Err(invalid("audio.block_frames", "must be at least 1"));
        }
        if self.audio.queue_capacity == 0 {
            return Err(invalid("audio.queue_capacity", "must be at least 1"));
        }
        if self.audio.sample_rate == Some(0) {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if self.rotation.template.is_empty() {
            return Err(invalid("rotation.template", "needs at least one component"));
        }
        // Components must go strictly from coarse to fine.
        for pair in self.rotation.template.windows(2) {
            if pair[0] >= pair[1] {
                return Err(invalid(
                    "rotation.template",
                    format!("`{:?}` cannot precede `{:?}`", pair[0], pair[1]),
                ));
            }
        }
        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(invalid(
                "logging.level",
                format!("`{}` is not a log level", self.logging.level),
            ));
        }
        if self.storage.prefix.contains(['/', '\\']) {
            return Err(invalid("storage.prefix", "must not contain path separators"));
        }
        Ok(())
    }

    /// Resolved storage root.
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| AppPaths::new().default_storage_root)
    }

    /// Resolved index file inside the storage root.
    pub fn index_file(&self) -> PathBuf {
        paths::index_file(&self.storage_root())
    }

    /// Resolved recordings tree inside the storage root.
    pub fn recordings_dir(&self) -> PathBuf {
        paths::recordings_dir(&self.storage_root())
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.version, loaded.version);
        assert_eq!(original.storage.prefix, loaded.storage.prefix);
        assert_eq!(original.storage.encoding, loaded.storage.encoding);
        assert_eq!(original.rotation.template, loaded.rotation.template);
        assert_eq!(original.audio.block_frames, loaded.audio.block_frames);
        assert_eq!(original.audio.queue_capacity, loaded.audio.queue_capacity);
        assert_eq!(original.logging.level, loaded.logging.level);
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.rotation.template.len(), 4);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[audio]\ninput_device = \"USB Mic\"\nqueue_capacity = 8\n\n[rotation]\ntemplate = [\"year\", \"month\"]\n",
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).expect("load");
        assert_eq!(cfg.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(cfg.audio.queue_capacity, 8);
        assert_eq!(cfg.audio.block_frames, 1024);
        assert_eq!(
            cfg.rotation.template,
            vec![TimeComponent::Year, TimeComponent::Month]
        );
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn zero_queue_capacity_is_rejected_at_load() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[audio]\nqueue_capacity = 0\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "audio.queue_capacity",
                ..
            }
        ));
    }

    #[test]
    fn template_must_run_coarse_to_fine() {
        let mut cfg = AppConfig::default();
        cfg.rotation.template = vec![TimeComponent::Day, TimeComponent::Month];
        assert!(cfg.validate().is_err());

        cfg.rotation.template = vec![TimeComponent::Hour, TimeComponent::Hour];
        assert!(cfg.validate().is_err());

        cfg.rotation.template = vec![TimeComponent::Minute, TimeComponent::Second];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_template_component_is_a_parse_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[rotation]\ntemplate = [\"fortnight\"]\n").unwrap();

        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn storage_root_override() {
        let mut cfg = AppConfig::default();
        cfg.storage.root = Some(PathBuf::from("/tmp/panauricon-test"));
        assert_eq!(
            cfg.index_file(),
            PathBuf::from("/tmp/panauricon-test/index.jsonl")
        );
        assert_eq!(
            cfg.recordings_dir(),
            PathBuf::from("/tmp/panauricon-test/recordings")
        );
    }

    #[test]
    fn unknown_logging_level_is_rejected_at_load() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "logging.level",
                ..
            }
        ));
    }

    #[test]
    fn logging_level_parses_with_fallback() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);
        logging.level = "DEBUG".into();
        assert_eq!(logging.level_filter(), log::LevelFilter::Debug);
        logging.level = "loud".into();
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);
    }
}
