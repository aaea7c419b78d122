//! Broker-side message records
//!
//! The broker treats bodies as opaque text. An `Envelope` is what sits in a
//! queue; it gains a delivery count each time it is handed to a consumer so
//! that repeatedly failing messages can be dead-lettered.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Broker-assigned id, independent of whatever id the body carries.
    pub message_id: String,
    pub body: String,
    /// Milliseconds since UNIX epoch; set when first enqueued.
    pub enqueued_at: i64,
    /// How many times this envelope has been delivered.
    pub delivery_count: u32,
}

/// A delivery that has been sent to a consumer and not yet settled.
#[derive(Debug, Clone)]
pub struct Unacked {
    pub session_id: String,
    pub queue: String,
    pub envelope: Envelope,
    pub delivered_at: i64,
}
