//! Message types shared across the pipeline, plus the versioned broker
//! envelope. The queue boundary is the only place raw payloads are decoded.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current broker wire format version. Bumped on incompatible changes to
/// [`Message`]; decoders reject anything they don't recognize.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SenderInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

/// An inbound message accepted from the producer. `id` is the idempotency
/// key — immutable once created, never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub source_channel_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub sender: SenderInfo,
    pub created_at: DateTime<Utc>,
}

/// Delivery state of a message as recorded in the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Success => "success",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "success" => Some(MessageStatus::Success),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Transport wrapper around a serialized [`Message`]. Created at enqueue,
/// destroyed at successful dequeue (or parked as a fallback file in between).
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub message: Message,
}

impl Envelope {
    pub fn encode(message: &Message) -> Result<String> {
        serde_json::to_string(&Envelope {
            version: ENVELOPE_VERSION,
            message: message.clone(),
        })
        .context("Failed to serialize message envelope")
    }

    pub fn decode(payload: &str) -> Result<Message> {
        let envelope: Envelope =
            serde_json::from_str(payload).context("Failed to parse message envelope")?;
        if envelope.version != ENVELOPE_VERSION {
            bail!(
                "Unsupported envelope version {} (expected {})",
                envelope.version,
                ENVELOPE_VERSION
            );
        }
        Ok(envelope.message)
    }
}

#[cfg(test)]
mod tests;
