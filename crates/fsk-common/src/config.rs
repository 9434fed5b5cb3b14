//! Configuration structures for the FSK player.
//!
//! Supports TOML deserialization with defaults suitable for a
//! 600 baud cassette stream timed in microsecond ticks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level player configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Serial baud rate used to derive the bit time.
    pub baud_rate: u32,

    /// Duration of one delay unit.
    #[serde(with = "human_duration")]
    pub tick: Duration,

    /// Explicit bit time in ticks; overrides `baud_rate` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_time: Option<u16>,

    /// Real-time configuration.
    pub realtime: RealtimeConfig,

    /// Deadline waiter tuning.
    pub waiter: WaiterConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            baud_rate: 600,
            tick: Duration::from_micros(1),
            bit_time: None,
            realtime: RealtimeConfig::default(),
            waiter: WaiterConfig::default(),
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enter real-time mode around playback (requires privileges).
    pub enabled: bool,

    /// Offset below the maximum round-robin priority.
    pub priority: u8,

    /// Lock resident memory pages (mlockall).
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: 0,
            lock_memory: true,
            prefault_stack_size: 100_000,
        }
    }
}

/// Deadline waiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterConfig {
    /// Remaining time below which the waiter spins instead of sleeping.
    #[serde(with = "human_duration")]
    pub sleep_threshold: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            sleep_threshold: Duration::from_micros(20),
        }
    }
}

impl PlayerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick must be non-zero".into()));
        }
        match self.bit_time {
            Some(0) => Err(ConfigError::Invalid("bit_time must be non-zero".into())),
            None if self.baud_rate == 0 => {
                Err(ConfigError::Invalid("baud_rate must be non-zero".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::error::FskError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// `Duration` fields as humantime strings (`"1us"`, `"20us"`, `"2ms"`).
mod human_duration {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::borrow::Cow;
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, out: S) -> Result<S::Ok, S::Error> {
        out.collect_str(&humantime::format_duration(*value))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(input: D) -> Result<Duration, D::Error> {
        let text = Cow::<str>::deserialize(input)?;
        humantime::parse_duration(text.trim())
            .map_err(|e| D::Error::custom(format!("invalid duration {text:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.baud_rate, 600);
        assert_eq!(config.tick, Duration::from_micros(1));
        assert!(config.bit_time.is_none());
        assert!(!config.realtime.enabled);
        assert_eq!(config.realtime.prefault_stack_size, 100_000);
        assert_eq!(config.waiter.sleep_threshold, Duration::from_micros(20));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            baud_rate = 1200
            tick = "10us"

            [realtime]
            enabled = true
            priority = 5
            lock_memory = false

            [waiter]
            sleep_threshold = "50us"
        "#;

        let config = PlayerConfig::from_toml(toml).unwrap();
        assert_eq!(config.baud_rate, 1200);
        assert_eq!(config.tick, Duration::from_micros(10));
        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.priority, 5);
        assert!(!config.realtime.lock_memory);
        assert_eq!(config.realtime.prefault_stack_size, 100_000);
        assert_eq!(config.waiter.sleep_threshold, Duration::from_micros(50));
    }

    #[test]
    fn test_explicit_bit_time() {
        let config = PlayerConfig::from_toml("bit_time = 1667").unwrap();
        assert_eq!(config.bit_time, Some(1667));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(
            PlayerConfig::from_toml(r#"tick = "0s""#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PlayerConfig::from_toml("baud_rate = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PlayerConfig::from_toml("bit_time = 0"),
            Err(ConfigError::Invalid(_))
        ));
        // An explicit bit time makes the baud rate irrelevant.
        assert!(PlayerConfig::from_toml("baud_rate = 0\nbit_time = 100").is_ok());
    }

    #[test]
    fn test_into_fsk_error() {
        let err: crate::error::FskError = ConfigError::Invalid("tick must be non-zero".into()).into();
        assert_eq!(
            err,
            crate::error::FskError::Config("invalid configuration: tick must be non-zero".into())
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bad_duration_string() {
        let err = PlayerConfig::from_toml(r#"tick = "fast""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("invalid duration \"fast\""), "{err}");

        // Surrounding whitespace is tolerated.
        let config = PlayerConfig::from_toml(r#"tick = " 5us ""#).unwrap();
        assert_eq!(config.tick, Duration::from_micros(5));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = PlayerConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = PlayerConfig::from_toml(&toml).unwrap();
        assert_eq!(config.tick, parsed.tick);
        assert_eq!(config.waiter.sleep_threshold, parsed.waiter.sleep_threshold);
        assert!(!toml.contains("bit_time"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "baud_rate = 300").unwrap();
        let config = PlayerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.baud_rate, 300);

        let missing = PlayerConfig::from_file(std::path::Path::new("/nonexistent/fsk.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_json_view() {
        let json = serde_json::to_value(PlayerConfig::default()).unwrap();
        assert_eq!(json["tick"], "1us");
        assert_eq!(json["realtime"]["priority"], 0);
    }
}
