//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "contactrelay.toml",
    "./config/config.toml",
    "/etc/contactrelay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("CONTACTRELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Gateway
        if let Ok(val) = env::var("CONTACTRELAY_GATEWAY_URL") {
            config.gateway.api_url = val;
        }
        if let Ok(val) = env::var("CONTACTRELAY_GATEWAY_API_KEY") {
            config.gateway.api_key = val;
        }
        if let Ok(val) = env::var("CONTACTRELAY_COUNTRY_PREFIX") {
            config.gateway.default_country_prefix = val;
        }

        // Window
        if let Ok(val) = env::var("CONTACTRELAY_WINDOW_START_HOUR") {
            if let Ok(hour) = val.parse() {
                config.window.start_hour = hour;
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_WINDOW_END_HOUR") {
            if let Ok(hour) = val.parse() {
                config.window.end_hour = hour;
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_TIMEZONE") {
            config.window.timezone = val;
        }

        // Limits
        if let Ok(val) = env::var("CONTACTRELAY_DAILY_CAP") {
            // empty or "none" clears the cap
            if val.is_empty() || val.eq_ignore_ascii_case("none") {
                config.limits.daily_cap = None;
            } else if let Ok(cap) = val.parse() {
                config.limits.daily_cap = Some(cap);
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_SESSION_CAP") {
            if let Ok(cap) = val.parse() {
                config.limits.session_cap = cap;
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_SEND_DELAY_SECS") {
            if let Ok(secs) = val.parse() {
                config.limits.send_delay_secs = secs;
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_DEDUP_WINDOW_MINUTES") {
            if let Ok(mins) = val.parse() {
                config.limits.dedup_window_minutes = mins;
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_STALE_THRESHOLD_MINUTES") {
            if let Ok(mins) = val.parse() {
                config.limits.stale_threshold_minutes = mins;
            }
        }

        // Directory
        if let Ok(val) = env::var("CONTACTRELAY_DIRECTORY_ENABLED") {
            config.directory.enabled = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = env::var("CONTACTRELAY_DIRECTORY_URL") {
            config.directory.base_url = val;
        }
        if let Ok(val) = env::var("CONTACTRELAY_DIRECTORY_TOKEN") {
            config.directory.api_token = val;
        }

        // Store
        if let Ok(val) = env::var("CONTACTRELAY_DB_URL") {
            config.store.db_url = val;
        }

        // Dispatch loop
        if let Ok(val) = env::var("CONTACTRELAY_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                config.dispatch.poll_interval_secs = secs;
            }
        }
        if let Ok(val) = env::var("CONTACTRELAY_HEALTH_PORT") {
            if let Ok(port) = val.parse() {
                config.dispatch.health_port = port;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
