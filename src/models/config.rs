//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Recipient, Subscription, Target};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP client settings
    #[serde(default)]
    pub bot: BotConfig,

    /// Per-host request spacing
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Session refresh behavior
    #[serde(default)]
    pub auth: AuthConfig,

    /// Fetch retry and block detection
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Notification retry and rendering
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Dedup store backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Shutdown behavior
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Messaging channels
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Monitored queries, in configuration order
    #[serde(default)]
    pub targets: Vec<Target>,

    /// Who gets notified about which target
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.bot.user_agent.trim().is_empty() {
            return Err(AppError::validation("bot.user_agent is empty"));
        }
        if self.bot.timeout_secs == 0 {
            return Err(AppError::validation("bot.timeout_secs must be > 0"));
        }
        if self.auth.max_attempts == 0 {
            return Err(AppError::validation("auth.max_attempts must be > 0"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(AppError::validation("fetch.max_attempts must be > 0"));
        }
        if self.delivery.max_attempts == 0 {
            return Err(AppError::validation("delivery.max_attempts must be > 0"));
        }
        for marker in &self.fetch.block_markers {
            regex::Regex::new(marker).map_err(|e| {
                AppError::validation(format!("fetch.block_markers entry '{marker}': {e}"))
            })?;
        }

        if self.targets.is_empty() {
            return Err(AppError::validation("No targets defined"));
        }
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !names.insert(target.name.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if !keys.insert(target.key()) {
                return Err(AppError::validation(format!(
                    "target '{}' queries the same thing as an earlier target",
                    target.name
                )));
            }
        }

        let mut channel_names = HashSet::new();
        for channel in &self.channels {
            if !channel_names.insert(channel.name()) {
                return Err(AppError::validation(format!(
                    "duplicate channel name '{}'",
                    channel.name()
                )));
            }
        }

        for sub in &self.subscriptions {
            if !names.contains(sub.target.as_str()) {
                return Err(AppError::validation(format!(
                    "subscription refers to unknown target '{}'",
                    sub.target
                )));
            }
            for recipient in &sub.recipients {
                if !channel_names.contains(recipient.channel.as_str()) {
                    return Err(AppError::validation(format!(
                        "subscription for '{}' refers to unknown channel '{}'",
                        sub.target, recipient.channel
                    )));
                }
            }
        }
        Ok(())
    }

    /// All distinct recipients subscribed to a target.
    pub fn recipients_for(&self, target_name: &str) -> Vec<Recipient> {
        let mut seen = HashSet::new();
        self.subscriptions
            .iter()
            .filter(|s| s.target == target_name)
            .flat_map(|s| s.recipients.iter())
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect()
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// Aggregate request spacing per destination host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum gap between any two data requests to the same host
    #[serde(default = "defaults::per_host_interval")]
    pub per_host_interval_ms: u64,

    /// Minimum gap between two authentication attempts against the same host
    #[serde(default = "defaults::auth_interval")]
    pub auth_interval_ms: u64,
}

impl RateLimitConfig {
    pub fn per_host_interval(&self) -> Duration {
        Duration::from_millis(self.per_host_interval_ms)
    }

    pub fn auth_interval(&self) -> Duration {
        Duration::from_millis(self.auth_interval_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_host_interval_ms: defaults::per_host_interval(),
            auth_interval_ms: defaults::auth_interval(),
        }
    }
}

/// Session refresh behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication attempts per cycle before giving up
    #[serde(default = "defaults::auth_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::auth_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::auth_max_delay")]
    pub max_delay_ms: u64,

    /// Sessions older than this are refreshed before use
    #[serde(default = "defaults::session_max_age")]
    pub session_max_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::auth_attempts(),
            base_delay_ms: defaults::auth_base_delay(),
            max_delay_ms: defaults::auth_max_delay(),
            session_max_age_secs: defaults::session_max_age(),
        }
    }
}

/// Fetch retry and block detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempts per cycle for transient failures
    #[serde(default = "defaults::fetch_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::fetch_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::fetch_max_delay")]
    pub max_delay_ms: u64,

    /// Case-insensitive regexes that identify a challenge or block page
    #[serde(default = "defaults::block_markers")]
    pub block_markers: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::fetch_attempts(),
            base_delay_ms: defaults::fetch_base_delay(),
            max_delay_ms: defaults::fetch_max_delay(),
            block_markers: defaults::block_markers(),
        }
    }
}

/// Notification retry and rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "defaults::delivery_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::delivery_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::delivery_max_delay")]
    pub max_delay_ms: u64,

    /// Also notify when slots disappear
    #[serde(default)]
    pub notify_disappeared: bool,

    /// Message template, see `NotificationEvent::format`
    #[serde(default = "defaults::template")]
    pub template: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::delivery_attempts(),
            base_delay_ms: defaults::delivery_base_delay(),
            max_delay_ms: defaults::delivery_max_delay(),
            notify_disappeared: false,
            template: defaults::template(),
        }
    }
}

/// Dedup store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root directory of the local backend
    #[serde(default = "defaults::storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            dir: defaults::storage_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight network calls may continue after a shutdown signal
    #[serde(default = "defaults::grace")]
    pub grace_secs: u64,
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: defaults::grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// A configured messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Write notifications to the log
    Log { name: String },

    /// POST a JSON payload to a URL
    Webhook { name: String, url: String },

    /// Telegram Bot API; the token is read from the named environment variable
    Telegram {
        name: String,
        token_env: String,
        #[serde(default = "defaults::telegram_api")]
        api_base: String,
    },
}

impl ChannelConfig {
    pub fn name(&self) -> &str {
        match self {
            ChannelConfig::Log { name }
            | ChannelConfig::Webhook { name, .. }
            | ChannelConfig::Telegram { name, .. } => name,
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn user_agent() -> String {
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36".into()
    }
    pub fn timeout() -> u64 {
        20
    }

    pub fn per_host_interval() -> u64 {
        5_000
    }
    pub fn auth_interval() -> u64 {
        30_000
    }

    pub fn auth_attempts() -> u32 {
        3
    }
    pub fn auth_base_delay() -> u64 {
        2_000
    }
    pub fn auth_max_delay() -> u64 {
        60_000
    }
    pub fn session_max_age() -> u64 {
        900
    }

    pub fn fetch_attempts() -> u32 {
        3
    }
    pub fn fetch_base_delay() -> u64 {
        1_000
    }
    pub fn fetch_max_delay() -> u64 {
        30_000
    }
    pub fn block_markers() -> Vec<String> {
        vec![
            "captcha".into(),
            "cf-challenge".into(),
            "too many requests".into(),
            "request unsuccessful".into(),
            "access denied".into(),
        ]
    }

    pub fn delivery_attempts() -> u32 {
        4
    }
    pub fn delivery_base_delay() -> u64 {
        1_000
    }
    pub fn delivery_max_delay() -> u64 {
        30_000
    }
    pub fn template() -> String {
        "[{change}] {target} ({key}): {date} {time} @ {location} {qualifiers}".into()
    }

    pub fn storage_dir() -> PathBuf {
        PathBuf::from("storage")
    }

    pub fn grace() -> u64 {
        10
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn telegram_api() -> String {
        "https://api.telegram.org".into()
    }
}
