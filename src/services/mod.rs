//! Service layer for the monitoring bot.
//!
//! This module contains the portal-facing and subscriber-facing pieces:
//! - Session management (`SessionProvider`, `Authenticator`)
//! - Slot fetching (`Fetcher`, `HtmlFetcher`, `JsonFetcher`)
//! - Delivery (`Notifier`, `Channel` and its implementations)

pub mod channels;
pub mod fetcher;
pub mod notifier;
pub mod session;

pub use channels::{LogChannel, TelegramChannel, WebhookChannel, build_channels};
pub use fetcher::{BlockDetector, Fetcher, HtmlFetcher, JsonFetcher, build_fetcher};
pub use notifier::{Channel, DeliveryReport, DeliveryResult, Notifier};
pub use session::{
    AnonymousAuthenticator, Authenticator, CookieAuthenticator, SessionProvider,
    build_authenticator,
};
