//! Subscriptions and outbound notification events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Slot, TargetKey};

/// Someone to notify, addressed through a named channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// Name of a configured channel
    pub channel: String,

    /// Channel-specific address (chat id, webhook tag, ...)
    pub address: String,
}

/// Binds recipients to a target by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub target: String,
    pub recipients: Vec<Recipient>,
}

/// What happened to a slot between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotChange {
    Appeared,
    Disappeared,
}

impl SlotChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotChange::Appeared => "new slot",
            SlotChange::Disappeared => "slot gone",
        }
    }
}

/// Delivery state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// One outbound message for one slot change, addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub target_key: TargetKey,

    /// Target description at the time the change was detected
    pub target_label: String,

    pub slot: Slot,

    pub change: SlotChange,

    pub recipient: Recipient,

    pub status: DeliveryStatus,

    pub attempts: u32,

    pub detected_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Create a pending event.
    pub fn new(
        target_key: TargetKey,
        target_label: impl Into<String>,
        slot: Slot,
        change: SlotChange,
        recipient: Recipient,
    ) -> Self {
        Self {
            target_key,
            target_label: target_label.into(),
            slot,
            change,
            recipient,
            status: DeliveryStatus::Pending,
            attempts: 0,
            detected_at: Utc::now(),
        }
    }

    /// Render the message body from a template.
    ///
    /// Supported placeholders:
    /// - `{change}`, `{target}`, `{key}`
    /// - `{date}`, `{time}`, `{location}`, `{qualifiers}`
    pub fn format(&self, template: &str) -> String {
        template
            .replace("{change}", self.change.as_str())
            .replace("{target}", &self.target_label)
            .replace("{key}", self.target_key.as_str())
            .replace("{date}", &self.slot.date.format("%Y-%m-%d").to_string())
            .replace("{time}", &self.slot.time_label())
            .replace("{location}", &self.slot.location)
            .replace("{qualifiers}", &self.slot.qualifiers_label())
    }
}
