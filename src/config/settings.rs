//! Application settings

use crate::core::codec::{CodecType, LineEnding};
use crate::core::receiver::{ReceiveSettings, MAX_THRESHOLD_MS};
use crate::core::session::DEFAULT_MAX_LINES;
use crate::core::transport::{ChannelError, LinkConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("{}: {source}", path.display())]
    Io {
        /// Config file
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Link settings out of range
    #[error(transparent)]
    Invalid(#[from] ChannelError),

    /// Packet threshold beyond `MAX_THRESHOLD_MS`
    #[error("Threshold {0} ms exceeds {max} ms", max = MAX_THRESHOLD_MS)]
    ThresholdOutOfRange(u64),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Link framing
    pub link: LinkConfig,
    /// Receive packetization
    pub receive: ReceiveSettings,
    /// Log display
    pub display: DisplayConfig,
    /// Send path
    pub send: SendConfig,
    /// Export target
    pub export: ExportConfig,
}

/// Log display settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Display history cap (0 = unbounded)
    pub max_lines: usize,
    /// Follow new entries
    pub auto_scroll: bool,
    /// Active view
    pub view: CodecType,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            auto_scroll: true,
            view: CodecType::Hex,
        }
    }
}

/// Send settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// Terminator appended to text and hex sends
    pub line_ending: LineEnding,
}

/// Export settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory for exported logs; current directory when unset
    pub directory: Option<PathBuf>,
}

impl AppConfig {
    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from `path`, or defaults if absent
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to `path`, creating parent directories
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

    /// Reject out-of-range link and receive settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        if self.receive.threshold_ms > MAX_THRESHOLD_MS {
            return Err(ConfigError::ThresholdOutOfRange(self.receive.threshold_ms));
        }
        Ok(())
    }

    /// Export directory, defaulting to the working directory
    pub fn export_dir(&self) -> PathBuf {
        self.export.directory.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::SerialParity;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.link.baud_rate, 115_200);
        assert_eq!(config.link.buffer_size, 8192);
        assert!(config.receive.timing_enabled);
        assert_eq!(config.receive.threshold_ms, 50);
        assert_eq!(config.display.max_lines, 1000);
        assert_eq!(config.display.view, CodecType::Hex);
        assert_eq!(config.send.line_ending, LineEnding::CrLf);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.link = LinkConfig::new(9600).port("/dev/ttyUSB0").parity(SerialParity::Even);
        config.receive.threshold_ms = 120;
        config.send.line_ending = LineEnding::Lf;
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[link]\nbaud_rate = 57600\n\n[display]\nview = \"text\"\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.link.baud_rate, 57600);
        assert_eq!(config.link.data_bits, 8);
        assert_eq!(config.display.view, CodecType::Text);
        assert_eq!(config.display.max_lines, 1000);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[link]\nbaud_rate = 0\n").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "[link\n").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Parse(_))));

        std::fs::write(&path, "[receive]\nthreshold_ms = 3600001\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ThresholdOutOfRange(3_600_001))
        ));

        let mut config = AppConfig::default();
        config.receive.threshold_ms = MAX_THRESHOLD_MS;
        assert!(config.validate().is_ok());
        config.receive.threshold_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::ThresholdOutOfRange(_))));
    }
}
