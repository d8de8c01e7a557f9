//! ContactRelay Configuration System
//!
//! TOML-based configuration with environment variable override support.

use cr_common::ColumnSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub window: WindowConfig,
    pub limits: LimitsConfig,
    pub directory: DirectoryConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            window: WindowConfig::default(),
            limits: LimitsConfig::default(),
            directory: DirectoryConfig::default(),
            store: StoreConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Messaging gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Send endpoint URL
    pub api_url: String,
    /// Bearer token for the gateway API
    pub api_key: String,
    /// Country prefix applied to numbers without one
    pub default_country_prefix: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://wasenderapi.com/api/send-message".to_string(),
            api_key: String::new(),
            default_country_prefix: "+39".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// Operating window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// First hour (inclusive) of the operating window
    pub start_hour: u32,
    /// Last hour (exclusive) of the operating window
    pub end_hour: u32,
    /// Fixed civil timezone the store and operators live in,
    /// regardless of where the process runs
    pub timezone: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 19,
            timezone: "Europe/Rome".to_string(),
        }
    }
}

/// Rate limits and concurrency-protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum sends per civil day; `None` means unlimited
    pub daily_cap: Option<u32>,
    /// Maximum sends within one dispatch cycle
    pub session_cap: u32,
    /// Delay between successive successful sends
    pub send_delay_secs: u64,
    /// Window during which a repeat send to the same number is suppressed
    pub dedup_window_minutes: i64,
    /// Age after which an IN_PROGRESS record is considered stuck
    pub stale_threshold_minutes: i64,
    /// Bounded wait for the cycle lock; timing out skips the cycle
    pub lock_wait_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_cap: None,
            session_cap: 20,
            send_delay_secs: 30,
            dedup_window_minutes: 30,
            stale_threshold_minutes: 15,
            lock_wait_ms: 10_000,
        }
    }
}

/// Directory (address book) side-channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// When false the controller never touches the directory service
    pub enabled: bool,
    pub base_url: String,
    pub api_token: String,
    /// Pause after creating a contact, to let the directory settle
    pub settle_delay_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_token: String::new(),
            settle_delay_secs: 2,
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database URL
    pub db_url: String,
    /// Column layout of the contacts table
    pub columns: ColumnSchema,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite://./data/contactrelay.db".to_string(),
            columns: ColumnSchema::default(),
        }
    }
}

/// Dispatcher loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub enabled: bool,
    /// Interval between timer-driven cycles
    pub poll_interval_secs: u64,
    /// Health endpoint port
    pub health_port: u16,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 600,
            health_port: 9090,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Reject configurations the dispatcher cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.start_hour >= 24 || self.window.end_hour > 24 {
            return Err(ConfigError::ValidationError(format!(
                "operating window hours out of range: {}-{}",
                self.window.start_hour, self.window.end_hour
            )));
        }
        if self.window.start_hour >= self.window.end_hour {
            return Err(ConfigError::ValidationError(format!(
                "operating window start must precede end: {}-{}",
                self.window.start_hour, self.window.end_hour
            )));
        }
        if self.limits.session_cap == 0 {
            return Err(ConfigError::ValidationError(
                "session_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# ContactRelay Configuration
# Environment variables override these settings

[gateway]
api_url = "https://wasenderapi.com/api/send-message"
api_key = ""
default_country_prefix = "+39"
connect_timeout_secs = 10
request_timeout_secs = 30

[window]
start_hour = 9
end_hour = 19
timezone = "Europe/Rome"

[limits]
# daily_cap = 50        # omit for unlimited
session_cap = 20
send_delay_secs = 30
dedup_window_minutes = 30
stale_threshold_minutes = 15
lock_wait_ms = 10000

[directory]
enabled = false
base_url = ""
api_token = ""
settle_delay_secs = 2

[store]
db_url = "sqlite://./data/contactrelay.db"

[store.columns]
name = 0
surname = 1
phone = 2
call_date = 4
outcome = 5
pos = 6
operator = 7
template_id = 8
status = 9
dispatched_at = 10
directory_flag = 11

[dispatch]
enabled = true
poll_interval_secs = 600
health_port = 9090
"#
        .to_string()
    }
}
