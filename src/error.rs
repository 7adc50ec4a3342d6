// src/error.rs

//! Unified error handling for the monitoring bot.

use std::fmt;

use thiserror::Error;

/// Result type alias for bot operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built or a request could not be prepared
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network failure, timeout or 5xx from the portal
    #[error("Transient fetch error for {target}: {message}")]
    TransientFetch { target: String, message: String },

    /// Anti-automation challenge, rate-limit page or rejected session
    #[error("Blocked by {target}: {reason}")]
    Blocked { target: String, reason: String },

    /// Response shape did not match the configured layout
    #[error("Parse error for {target}: {message}")]
    Parse { target: String, message: String },

    /// Authentication kept failing for the whole retry budget
    #[error("Authentication exhausted for {target} after {attempts} attempt(s): {last_error}")]
    AuthExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    /// A messaging channel refused or failed to deliver a message
    #[error("Delivery via {channel} failed: {message}")]
    Delivery { channel: String, message: String },

    /// Snapshot store could not read or replace a record
    #[error("Persistence error for {key}: {message}")]
    Persistence { key: String, message: String },

    /// Work was abandoned because shutdown passed its grace period
    #[error("Cancelled during shutdown")]
    Cancelled,
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a transient fetch error.
    pub fn transient(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::TransientFetch {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Create a blocked error.
    pub fn blocked(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Blocked {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a parse error.
    pub fn parse(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Create a delivery error.
    pub fn delivery(channel: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Delivery {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Persistence {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Short, stable label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Toml(_) => "toml",
            Self::Selector { .. } => "selector",
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::TransientFetch { .. } => "transient_fetch",
            Self::Blocked { .. } => "blocked",
            Self::Parse { .. } => "parse",
            Self::AuthExhausted { .. } => "auth_exhausted",
            Self::Delivery { .. } => "delivery",
            Self::Persistence { .. } => "persistence",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether retrying the same request later in the cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }
}
