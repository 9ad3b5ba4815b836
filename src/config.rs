//! Configuration for the health event agent.

use crate::delivery::{BackgroundFrequency, ChannelConfig, DeliveryPolicy, RetryPolicy, Zone};
use crate::event_log::DEFAULT_EVENT_LOG_KEY;
use crate::tracker::DEFAULT_UNREAD_COUNTER_KEY;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the store file
    pub data_path: PathBuf,

    /// Store file name inside `data_path`
    pub store_file: String,

    pub event_log_key: String,
    pub unread_counter_key: String,

    /// IANA zone name for day boundaries; host local zone when unset
    pub timezone: Option<String>,

    /// Channels to observe and what to query for each
    pub channels: Vec<ChannelConfig>,

    pub background_frequency: BackgroundFrequency,

    /// Delay before a notification is shown
    #[serde(with = "duration_serde")]
    pub notification_delay: Duration,

    /// Upper bound on one aggregate query
    #[serde(with = "duration_serde")]
    pub query_timeout: Duration,

    pub query_retry: RetryPolicy,

    /// Whether foreground/background transitions are logged as events
    pub record_lifecycle_events: bool,

    /// Capacity of each queued log subscription
    pub observer_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("health-event-agent");

        Self {
            data_path: data_dir,
            store_file: "store.json".to_string(),
            event_log_key: DEFAULT_EVENT_LOG_KEY.to_string(),
            unread_counter_key: DEFAULT_UNREAD_COUNTER_KEY.to_string(),
            timezone: None,
            channels: vec![
                ChannelConfig::step_count_today(),
                ChannelConfig::sleep_trailing_week(),
            ],
            background_frequency: BackgroundFrequency::Immediate,
            notification_delay: Duration::from_secs(1),
            query_timeout: Duration::from_secs(60),
            query_retry: RetryPolicy::default(),
            record_lifecycle_events: true,
            observer_queue_capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.zone()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("health-event-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_path.join(&self.store_file)
    }

    /// Zone used for day boundaries.
    pub fn zone(&self) -> Result<Zone, ConfigError> {
        match &self.timezone {
            None => Ok(Zone::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(Zone::Named)
                .map_err(|_| ConfigError::InvalidTimezone(name.clone())),
        }
    }

    /// Orchestrator settings derived from this configuration.
    pub fn delivery_policy(&self) -> Result<DeliveryPolicy, ConfigError> {
        Ok(DeliveryPolicy {
            frequency: self.background_frequency,
            zone: self.zone()?,
            query_timeout: (!self.query_timeout.is_zero()).then_some(self.query_timeout),
            retry: self.query_retry,
        })
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidTimezone(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::InvalidTimezone(name) => write!(f, "Unknown time zone: {name}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration, as whole seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
