use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{MessageId, MessageStatus, RecipientKey, UserId};

const CLIENT_ENVELOPE_TYPES: &[&str] = &["message", "status_update", "read_receipt"];

/// Frames a client sends over its connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Message {
        receiver_id: UserId,
        content: String,
        keys: Vec<RecipientKey>,
        /// RFC 3339 timestamp; validated by the relay, not by the decoder.
        expires_at: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<String>,
    },
    StatusUpdate {
        message_id: MessageId,
        status: MessageStatus,
    },
    ReadReceipt {
        message_id: MessageId,
    },
}

impl ClientEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::StatusUpdate { .. } => "status_update",
            Self::ReadReceipt { .. } => "read_receipt",
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes one inbound text frame, telling unknown `type` tags apart from
/// frames that are not valid envelopes at all.
pub fn decode_client_envelope(text: &str) -> Result<ClientEnvelope, EnvelopeError> {
    let error = match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => return Ok(envelope),
        Err(error) => error,
    };

    let tag = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| {
            value
                .get("type")
                .and_then(|tag| tag.as_str())
                .map(str::to_owned)
        });
    match tag {
        Some(tag) if !CLIENT_ENVELOPE_TYPES.contains(&tag.as_str()) => {
            Err(EnvelopeError::UnknownType(tag))
        }
        _ => Err(EnvelopeError::Malformed(error)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub keys: Vec<RecipientKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<String>,
    pub status: MessageStatus,
    pub expires_at: DateTime<Utc>,
}

/// Frames the relay pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEnvelope {
    NewMessage {
        message: MessagePayload,
    },
    MessageSent {
        message_id: MessageId,
        status: MessageStatus,
    },
    StatusUpdate {
        message_id: MessageId,
        status: MessageStatus,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
