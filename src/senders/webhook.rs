//! Generic HTTP webhook sender: posts the payload as JSON to a configured
//! endpoint and maps the response onto the failure taxonomy.

use super::{ErrorClass, MappingTarget, Payload, SendError, Sender};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct WebhookBody<'a> {
    message_id: &'a str,
    bot_id: &'a str,
    channel_id: &'a str,
    content: &'a str,
    sender_name: &'a str,
    attachments: &'a [crate::bus::Attachment],
}

pub struct WebhookSender {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client for webhook sender")?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ErrorClass::RateLimited
        } else if status.is_client_error() {
            ErrorClass::Permanent
        } else if status.is_server_error() {
            ErrorClass::Transient
        } else {
            ErrorClass::Unknown
        }
    }
}

#[async_trait]
impl Sender for WebhookSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, target: &MappingTarget, payload: &Payload) -> Result<(), SendError> {
        let body = WebhookBody {
            message_id: &payload.message_id,
            bot_id: &target.bot_id,
            channel_id: &target.channel_id,
            content: &payload.content,
            sender_name: &payload.sender_name,
            attachments: &payload.attachments,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let class = if e.is_timeout() || e.is_connect() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Unknown
                };
                SendError::new(class, format!("webhook request failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(
                "webhook delivered message {} to {}:{}",
                payload.message_id, target.platform, target.channel_id
            );
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(SendError::new(
            Self::classify_status(status),
            format!("webhook returned {}: {}", status, detail),
        ))
    }
}
