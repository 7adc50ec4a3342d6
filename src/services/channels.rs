// src/services/channels.rs

//! Messaging channel implementations.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{ChannelConfig, NotificationEvent, Slot};
use crate::services::notifier::Channel;
use crate::utils::snippet;

/// Writes notifications to the log. Useful for dry runs.
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent, text: &str) -> Result<()> {
        log::info!("[{}] -> {}: {}", self.name, event.recipient.address, text);
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
    recipient: &'a str,
    target: &'a str,
    target_key: &'a str,
    change: &'a str,
    slot: &'a Slot,
    detected_at: String,
}

/// POSTs a JSON payload per event.
pub struct WebhookChannel {
    name: String,
    url: String,
    client: Client,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent, text: &str) -> Result<()> {
        let payload = WebhookPayload {
            text,
            recipient: &event.recipient.address,
            target: &event.target_label,
            target_key: event.target_key.as_str(),
            change: event.change.as_str(),
            slot: &event.slot,
            detected_at: event.detected_at.to_rfc3339(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::delivery(&self.name, e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::delivery(
                &self.name,
                format!("HTTP {status}: {}", snippet(&body, 120)),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Sends through the Telegram Bot API. The recipient address is the chat id.
pub struct TelegramChannel {
    name: String,
    endpoint: String,
    client: Client,
}

impl TelegramChannel {
    pub fn new(name: impl Into<String>, api_base: &str, token: &str, client: Client) -> Self {
        Self {
            name: name.into(),
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
            client,
        }
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent, text: &str) -> Result<()> {
        let message = TelegramMessage {
            chat_id: &event.recipient.address,
            text,
            disable_web_page_preview: true,
        };
        // The request URL carries the token; never log reqwest's error text verbatim.
        let response = self
            .client
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| AppError::delivery(&self.name, e.without_url()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::delivery(&self.name, e.without_url()))?;
        let ok = body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        if !status.is_success() || !ok {
            let description = body
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("no description");
            return Err(AppError::delivery(
                &self.name,
                format!("HTTP {status}: {description}"),
            ));
        }
        Ok(())
    }
}

/// Build every configured channel.
///
/// Fails when a Telegram token variable is unset, so a broken setup is
/// reported at startup rather than at the first notification.
pub fn build_channels(configs: &[ChannelConfig], client: &Client) -> Result<Vec<Arc<dyn Channel>>> {
    configs
        .iter()
        .map(|config| -> Result<Arc<dyn Channel>> {
            Ok(match config {
                ChannelConfig::Log { name } => Arc::new(LogChannel::new(name)),
                ChannelConfig::Webhook { name, url } => {
                    Arc::new(WebhookChannel::new(name, url, client.clone()))
                }
                ChannelConfig::Telegram {
                    name,
                    token_env,
                    api_base,
                } => {
                    let token = std::env::var(token_env).map_err(|_| {
                        AppError::config(format!(
                            "channel '{name}' needs environment variable {token_env}"
                        ))
                    })?;
                    Arc::new(TelegramChannel::new(name, api_base, &token, client.clone()))
                }
            })
        })
        .collect()
}
