//! Wire codec for relay messages.
//!
//! A `Message` travels through the broker as the UTF-8 JSON object
//! `{ "id": <uuid>, "content": <string>, "createdAt": <RFC 3339> }`.
//! The broker never looks inside the body; only the ingress encodes and only
//! the consumer decodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::DecodeError;


/// The only domain entity: a piece of text accepted by the ingress.
///
/// `id` and `created_at` are assigned once at publish time and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Stamp `content` with a fresh id and the current UTC time.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

pub fn encode(message: &Message) -> Vec<u8> {
    // Serializing a struct of a uuid, a string and a timestamp cannot fail.
    serde_json::to_vec(message).unwrap_or_default()
}

/// Decode a payload produced by [`encode`].
///
/// Fails on malformed JSON, missing or mistyped fields, and blank content.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let message: Message = serde_json::from_slice(bytes)?;
    if message.content.trim().is_empty() {
        return Err(DecodeError::BlankContent);
    }
    Ok(message)
}
