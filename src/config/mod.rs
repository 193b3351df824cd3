use config::{Config, ConfigError, Environment, File};
use gotcha::ConfigWrapper;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Per-connection settings for `/ws/vehicle/filter`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LiveFeedConfig {
    /// A write slower than this closes the connection (default: 5000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Shorter timeouts fail nearly every write
pub const MIN_WRITE_TIMEOUT_MS: u64 = 10;

fn default_write_timeout_ms() -> u64 {
    5000
}

impl Default for LiveFeedConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl LiveFeedConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout_ms < MIN_WRITE_TIMEOUT_MS {
            return Err(ConfigError::Message(format!(
                "live_feed.write_timeout_ms must be at least {}, got {}",
                MIN_WRITE_TIMEOUT_MS, self.write_timeout_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    pub database_url: String,
    /// Service bearer token accepted alongside user login tokens; lets the
    /// first account be created. Empty disables it.
    pub user_token: String,
    #[serde(default)]
    pub live_feed: LiveFeedConfig,
}

impl Settings {
    pub fn new() -> Result<ConfigWrapper<Self>, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Environment overrides, e.g. TRACKER_APPLICATION__USER_TOKEN
            .add_source(
                Environment::with_prefix("TRACKER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let settings: ConfigWrapper<Self> = s.try_deserialize()?;
        settings.application.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.live_feed.validate()
    }
}
