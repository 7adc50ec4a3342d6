// src/models/mod.rs

//! Domain models for the monitoring bot.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod notification;
mod session;
mod slot;
mod target;

// Re-export all public types
pub use config::{
    AuthConfig, BotConfig, ChannelConfig, Config, DeliveryConfig, FetchConfig, LoggingConfig,
    RateLimitConfig, ShutdownConfig, StorageBackend, StorageConfig,
};
pub use notification::{DeliveryStatus, NotificationEvent, Recipient, SlotChange, Subscription};
pub use session::{SessionCredentials, SessionHandle, SessionHealth, SessionState};
pub use slot::{Slot, Snapshot};
pub use target::{AuthMethod, HtmlLayout, JsonLayout, PollPolicy, SiteLayout, Target, TargetKey};
