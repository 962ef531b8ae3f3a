//! The outbound delivery seam. The pipeline treats senders as opaque: one
//! call per (message, mapping), a classified error back. Platform-specific
//! formatting lives behind the implementations, not here.

use crate::bus::{Attachment, Message};
use crate::store::ChannelMapping;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod webhook;

pub use webhook::WebhookSender;

/// Failure taxonomy the retry policy keys off. The reference pipeline
/// retries all classes on the same fixed interval; the class is carried and
/// persisted so a stricter policy can be layered on later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Whether a stricter policy would re-attempt this class.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {}", .class.as_str(), .message)]
pub struct SendError {
    pub class: ErrorClass,
    pub message: String,
}

impl SendError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// Where a payload goes: one destination resolved from a mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingTarget {
    pub platform: String,
    pub bot_id: String,
    pub channel_id: String,
}

impl From<&ChannelMapping> for MappingTarget {
    fn from(mapping: &ChannelMapping) -> Self {
        Self {
            platform: mapping.target_platform.clone(),
            bot_id: mapping.target_bot_id.clone(),
            channel_id: mapping.target_channel_id.clone(),
        }
    }
}

/// Content handed to a sender. Deliberately close to the raw message —
/// per-platform formatting is out of scope for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub message_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub sender_name: String,
}

impl From<&Message> for Payload {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            sender_name: message.sender.display_name.clone(),
        }
    }
}

#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, target: &MappingTarget, payload: &Payload) -> Result<(), SendError>;
}

/// Senders keyed by target platform. A mapping whose platform has no
/// registered sender fails permanently — retrying cannot fix configuration.
#[derive(Default)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, platform: impl Into<String>, sender: Arc<dyn Sender>) {
        let platform = platform.into();
        debug!("registered sender for platform {}", platform);
        self.senders.insert(platform, sender);
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.senders.keys().map(String::as_str).collect()
    }

    pub async fn send_to(
        &self,
        mapping: &ChannelMapping,
        payload: &Payload,
    ) -> Result<(), SendError> {
        let Some(sender) = self.senders.get(&mapping.target_platform) else {
            return Err(SendError::new(
                ErrorClass::Permanent,
                format!("no sender registered for platform {}", mapping.target_platform),
            ));
        };
        let target = MappingTarget::from(mapping);
        sender.send(&target, payload).await
    }
}
