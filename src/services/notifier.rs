// src/services/notifier.rs

//! Notification delivery with bounded retries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{DeliveryStatus, NotificationEvent};
use crate::pipeline::backoff::RetryPolicy;

/// A messaging channel events can be sent through.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Send one rendered message to the event's recipient.
    async fn send(&self, event: &NotificationEvent, text: &str) -> Result<()>;
}

/// Final outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Sent { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// Shutdown interrupted delivery; the event stays pending.
    Interrupted,
}

/// Routes events to channels by recipient.
pub struct Notifier {
    channels: HashMap<String, Arc<dyn Channel>>,
    retry: RetryPolicy,
    template: String,
}

impl Notifier {
    pub fn new(
        channels: impl IntoIterator<Item = Arc<dyn Channel>>,
        retry: RetryPolicy,
        template: impl Into<String>,
    ) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect(),
            retry,
            template: template.into(),
        }
    }

    /// Deliver one event, retrying up to the policy's budget.
    ///
    /// Updates the event's status and attempt count in place.
    pub async fn notify(&self, event: &mut NotificationEvent) -> DeliveryResult {
        let Some(channel) = self.channels.get(&event.recipient.channel) else {
            let error = format!("unknown channel '{}'", event.recipient.channel);
            log::error!("[{}] {}", event.target_label, error);
            event.status = DeliveryStatus::Failed;
            return DeliveryResult::Failed {
                attempts: event.attempts,
                error,
            };
        };

        let text = event.format(&self.template);
        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            event.attempts += 1;
            match channel.send(event, &text).await {
                Ok(()) => {
                    event.status = DeliveryStatus::Sent;
                    log::debug!(
                        "[{}] delivered to {}:{}",
                        event.target_label,
                        event.recipient.channel,
                        event.recipient.address
                    );
                    return DeliveryResult::Sent {
                        attempts: event.attempts,
                    };
                }
                Err(e) => {
                    log::warn!(
                        "[{}] delivery to {}:{} failed ({}/{}): {}",
                        event.target_label,
                        event.recipient.channel,
                        event.recipient.address,
                        attempt,
                        self.retry.max_attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        event.status = DeliveryStatus::Failed;
        log::error!(
            "[{}] giving up on {}:{} after {} attempt(s): {}",
            event.target_label,
            event.recipient.channel,
            event.recipient.address,
            event.attempts,
            last_error
        );
        DeliveryResult::Failed {
            attempts: event.attempts,
            error: last_error,
        }
    }

    /// Deliver events concurrently.
    ///
    /// Events still pending because `abort` fired before their delivery
    /// finished are handed back in the report. Sent and permanently failed
    /// events are dropped.
    pub async fn notify_all(
        &self,
        events: Vec<NotificationEvent>,
        abort: &CancellationToken,
    ) -> DeliveryReport {
        let deliveries = events.into_iter().map(|mut event| async move {
            let outcome = tokio::select! {
                result = self.notify(&mut event) => result,
                _ = abort.cancelled() => DeliveryResult::Interrupted,
            };
            if outcome == DeliveryResult::Interrupted {
                event.status = DeliveryStatus::Pending;
            }
            (outcome, event)
        });

        let mut report = DeliveryReport::default();
        for (outcome, event) in join_all(deliveries).await {
            match outcome {
                DeliveryResult::Sent { .. } => report.sent += 1,
                DeliveryResult::Failed { .. } => report.failed += 1,
                DeliveryResult::Interrupted => report.pending.push(event),
            }
        }
        report
    }
}

/// Totals for one batch of deliveries.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
    /// Events to keep in the outbox
    pub pending: Vec<NotificationEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::{Recipient, Slot, SlotChange, TargetKey};
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Recording {
        fail_first: u32,
        calls: AtomicU32,
        sent: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Channel for Recording {
        fn name(&self) -> &str {
            "ops"
        }

        async fn send(&self, _event: &NotificationEvent, text: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(AppError::delivery("ops", "503"));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl Channel for Hanging {
        fn name(&self) -> &str {
            "ops"
        }

        async fn send(&self, _event: &NotificationEvent, _text: &str) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn event(channel: &str) -> NotificationEvent {
        NotificationEvent::new(
            TargetKey::from("k1"),
            "madrid",
            Slot::new(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(), None, "Madrid"),
            SlotChange::Appeared,
            Recipient {
                channel: channel.into(),
                address: "42".into(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_sent() {
        let channel = Recording::new(2);
        let notifier = Notifier::new(
            [channel.clone() as Arc<dyn Channel>],
            RetryPolicy::new(4, 100, 1000),
            "{target} {date}",
        );
        let mut ev = event("ops");
        assert_eq!(
            notifier.notify(&mut ev).await,
            DeliveryResult::Sent { attempts: 3 }
        );
        assert_eq!(ev.status, DeliveryStatus::Sent);
        assert_eq!(channel.sent.lock().unwrap().as_slice(), ["madrid 2026-03-02"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let channel = Recording::new(u32::MAX);
        let notifier = Notifier::new(
            [channel.clone() as Arc<dyn Channel>],
            RetryPolicy::new(3, 100, 1000),
            "{target}",
        );
        let mut ev = event("ops");
        let result = notifier.notify(&mut ev).await;
        assert!(matches!(result, DeliveryResult::Failed { attempts: 3, .. }));
        assert_eq!(ev.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_channel_fails_without_attempts() {
        let notifier = Notifier::new(Vec::new(), RetryPolicy::new(3, 1, 1), "{target}");
        let mut ev = event("missing");
        assert!(matches!(
            notifier.notify(&mut ev).await,
            DeliveryResult::Failed { attempts: 0, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_keeps_events_pending() {
        let notifier = Notifier::new(
            [Arc::new(Hanging) as Arc<dyn Channel>],
            RetryPolicy::new(3, 100, 1000),
            "{target}",
        );
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let report = notifier
            .notify_all(vec![event("ops"), event("ops")], &abort)
            .await;
        assert_eq!(report.sent, 0);
        assert_eq!(report.pending.len(), 2);
        assert!(report.pending.iter().all(|e| e.status == DeliveryStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_all_drops_finished_events() {
        let channel = Recording::new(0);
        let notifier = Notifier::new(
            [channel.clone() as Arc<dyn Channel>],
            RetryPolicy::new(3, 100, 1000),
            "{target}",
        );
        let report = notifier
            .notify_all(
                vec![event("ops"), event("ops"), event("missing")],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!((report.sent, report.failed), (2, 1));
        assert!(report.pending.is_empty());
        assert_eq!(channel.sent.lock().unwrap().len(), 2);
    }
}
