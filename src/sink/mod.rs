//! In-memory record of consumed messages.
//!
//! `MessageSink` is a cheap-to-clone handle: the consumer worker appends
//! through one clone while HTTP handlers read through another. Entries are
//! kept in delivery order and never removed.

use std::sync::{Arc, PoisonError, RwLock};

use crate::codec::Message;


#[derive(Debug, Clone, Default)]
pub struct MessageSink {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl MessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, message: Message) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    pub fn count(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of every stored message, oldest first.
    pub fn list(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
