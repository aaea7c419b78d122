//! Queue management
//!
//! A `Queue` holds ready envelopes in FIFO order plus the sessions consuming
//! from it. Dispatch hands out envelopes round-robin across consumers.
//!
//! Concurrency note: callers must synchronize access to `Queue` (for example
//! via the broker lock).

use std::collections::VecDeque;

use crate::broker::message::Envelope;

pub type SessionId = String;

#[derive(Debug, Default)]
pub struct Queue {
    pub name: String,
    pub ready: VecDeque<Envelope>,
    pub consumers: Vec<SessionId>,
    next_consumer: usize,
}

impl Queue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Add a consumer to the queue. Duplicate adds are ignored.
    pub fn add_consumer(&mut self, id: SessionId) {
        if !self.consumers.contains(&id) {
            self.consumers.push(id);
        }
    }

    pub fn remove_consumer(&mut self, id: &SessionId) {
        self.consumers.retain(|c| c != id);
        if self.next_consumer >= self.consumers.len() {
            self.next_consumer = 0;
        }
    }

    /// Pick the next consumer, starting after the last one served, for which
    /// `has_capacity` holds.
    pub fn next_consumer(
        &mut self,
        has_capacity: impl Fn(&SessionId) -> bool,
    ) -> Option<SessionId> {
        let n = self.consumers.len();
        for offset in 0..n {
            let idx = (self.next_consumer + offset) % n;
            if has_capacity(&self.consumers[idx]) {
                self.next_consumer = (idx + 1) % n;
                return Some(self.consumers[idx].clone());
            }
        }
        None
    }
}
