//! Broker engine
//!
//! This module contains the in-memory broker implementation responsible for:
//! - managing named queues and the sessions consuming from them
//! - dispatching ready envelopes FIFO, round-robin across consumers, within
//!   each consumer's prefetch window
//! - settling deliveries on ack / nack and requeueing at the head of the queue
//! - dead-lettering envelopes that exhaust `max_deliveries` or are rejected
//!   without requeue
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`SharedBroker`) by the transport layer. Frames are pushed into
//!   per-session unbounded channels, so no network I/O happens under the lock.
//! - The redelivery loop runs as a background task and requeues deliveries
//!   whose ack did not arrive within the configured timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::{Envelope, Unacked};
use crate::broker::queue::{Queue, SessionId};
use crate::broker::session::Session;
use crate::config::ServerSettings;
use crate::persistence::{DeadLetter, DeadLetterStore};
use crate::transport::message::ServerFrame;
use crate::utils::error::{BrokerError, StoreError};

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the shared broker. A panic while holding the lock leaves the maps
/// consistent between calls, so a poisoned lock is recovered rather than
/// propagated.
pub fn lock_broker(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct Broker {
    pub queues: HashMap<String, Queue>,
    pub sessions: HashMap<SessionId, Session>,
    /// Outstanding deliveries keyed by delivery tag; tags increase monotonically.
    pub unacked: BTreeMap<u64, Unacked>,
    next_delivery_tag: u64,
    /// 0 disables dead-lettering on repeated failure.
    max_deliveries: u32,
    max_connections: usize,
    dead_letters: DeadLetterStore,
}

impl Broker {
    /// How often the redelivery loop scans for expired deliveries.
    const REDELIVERY_SCAN_MS: u64 = 1000;

    pub fn new(settings: &ServerSettings) -> Result<Self, StoreError> {
        let dead_letters = DeadLetterStore::open(
            &settings.dead_letter_path,
            settings.dead_letter_ttl_secs,
            settings.dead_letter_max_per_queue,
        )?;
        Ok(Self::with_dead_letters(
            dead_letters,
            settings.max_deliveries,
            settings.max_connections,
        ))
    }

    pub fn with_dead_letters(
        dead_letters: DeadLetterStore,
        max_deliveries: u32,
        max_connections: usize,
    ) -> Self {
        Self {
            queues: HashMap::new(),
            sessions: HashMap::new(),
            unacked: BTreeMap::new(),
            next_delivery_tag: 0,
            max_deliveries,
            max_connections,
            dead_letters,
        }
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn register_session(&mut self, session: Session) -> Result<(), BrokerError> {
        if self.sessions.len() >= self.max_connections {
            return Err(BrokerError::TooManyConnections(self.max_connections));
        }
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn mark_authenticated(&mut self, session_id: &str) -> Result<(), BrokerError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))?;
        session.authenticated = true;
        Ok(())
    }

    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.authenticated)
    }

    /// Declare a queue, creating it if needed. Returns `(ready, consumers)`.
    pub fn declare(&mut self, name: &str) -> (usize, usize) {
        let queue = self.queues.entry(name.to_string()).or_insert_with(|| {
            info!(queue = name, "queue declared");
            Queue::new(name)
        });
        (queue.ready.len(), queue.consumers.len())
    }

    /// Enqueue `body` at the tail of `queue` and dispatch. Returns the
    /// broker-assigned message id.
    pub fn publish(&mut self, queue: &str, body: String) -> Result<String, BrokerError> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        let message_id = Uuid::new_v4().to_string();
        q.ready.push_back(Envelope {
            message_id: message_id.clone(),
            body,
            enqueued_at: Utc::now().timestamp_millis(),
            delivery_count: 0,
        });
        debug!(queue, message_id = %message_id, depth = q.ready.len(), "message enqueued");

        self.dispatch(queue);
        Ok(message_id)
    }

    /// Register `session_id` as a consumer of `queue`. The caller is expected
    /// to send the `consume_ok` reply and then call [`Broker::dispatch`] so the
    /// reply precedes the first delivery.
    pub fn consume(
        &mut self,
        session_id: &str,
        queue: &str,
        prefetch: u16,
    ) -> Result<String, BrokerError> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))?;

        if let Some((current, _)) = &session.consuming {
            return Err(BrokerError::AlreadyConsuming(current.clone()));
        }

        let consumer_tag = format!("ctag-{}", Uuid::new_v4());
        session.consuming = Some((queue.to_string(), consumer_tag.clone()));
        session.prefetch = usize::from(prefetch.max(1));
        q.add_consumer(session_id.to_string());

        info!(session = session_id, queue, prefetch, "consumer registered");
        Ok(consumer_tag)
    }

    /// Hand ready envelopes to consumers with free prefetch capacity.
    pub fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues,
            sessions,
            unacked,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(session_id) =
                queue.next_consumer(|id| sessions.get(id).is_some_and(Session::has_capacity))
            else {
                break;
            };
            let Some(session) = sessions.get_mut(&session_id) else {
                break;
            };
            let Some(mut envelope) = queue.ready.pop_front() else {
                break;
            };

            let consumer_tag = session
                .consuming
                .as_ref()
                .map(|(_, tag)| tag.clone())
                .unwrap_or_default();
            let delivery_tag = *next_delivery_tag + 1;
            let delivery_count = envelope.delivery_count + 1;

            let frame = ServerFrame::Deliver {
                consumer_tag,
                delivery_tag,
                queue: queue_name.to_string(),
                body: envelope.body.clone(),
                redelivered: delivery_count > 1,
                delivery_count,
            };
            let ws = match frame.to_ws() {
                Ok(ws) => ws,
                Err(e) => {
                    error!(error = %e, "failed to serialize delivery");
                    queue.ready.push_front(envelope);
                    break;
                }
            };

            if session.sender.send(ws).is_err() {
                warn!(session = %session_id, "consumer channel closed, keeping message queued");
                queue.ready.push_front(envelope);
                queue.remove_consumer(&session_id);
                continue;
            }

            *next_delivery_tag = delivery_tag;
            envelope.delivery_count = delivery_count;
            session.in_flight += 1;
            debug!(
                session = %session_id,
                delivery_tag,
                delivery_count,
                "message delivered"
            );
            unacked.insert(
                delivery_tag,
                Unacked {
                    session_id,
                    queue: queue_name.to_string(),
                    envelope,
                    delivered_at: Utc::now().timestamp_millis(),
                },
            );
        }
    }

    /// Settle a delivery successfully.
    pub fn ack(&mut self, session_id: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        let settled = self.take_unacked(session_id, delivery_tag)?;
        debug!(session = session_id, delivery_tag, "message acknowledged");
        self.dispatch(&settled.queue);
        Ok(())
    }

    /// Settle a delivery as failed, either requeueing it at the head of its
    /// queue or dead-lettering it.
    pub fn nack(
        &mut self,
        session_id: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let settled = self.take_unacked(session_id, delivery_tag)?;
        let queue = settled.queue.clone();

        if requeue {
            debug!(session = session_id, delivery_tag, "message requeued by consumer");
            self.requeue(&settled.queue, settled.envelope);
        } else {
            self.dead_letter(&settled.queue, settled.envelope, "rejected without requeue");
        }

        self.dispatch(&queue);
        Ok(())
    }

    fn take_unacked(
        &mut self,
        session_id: &str,
        delivery_tag: u64,
    ) -> Result<Unacked, BrokerError> {
        match self.unacked.get(&delivery_tag) {
            Some(pending) if pending.session_id == session_id => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(delivery_tag)),
        }
        let settled = self
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.in_flight = session.in_flight.saturating_sub(1);
        }
        Ok(settled)
    }

    fn requeue(&mut self, queue: &str, envelope: Envelope) {
        if self.max_deliveries > 0 && envelope.delivery_count >= self.max_deliveries {
            self.dead_letter(queue, envelope, "max deliveries exceeded");
            return;
        }
        match self.queues.get_mut(queue) {
            Some(q) => q.ready.push_front(envelope),
            None => self.dead_letter(queue, envelope, "queue no longer exists"),
        }
    }

    fn dead_letter(&self, queue: &str, envelope: Envelope, reason: &str) {
        let letter = DeadLetter {
            queue: queue.to_string(),
            message_id: envelope.message_id,
            body: envelope.body,
            delivery_count: envelope.delivery_count,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now().timestamp_millis(),
        };
        match self.dead_letters.store(&letter) {
            Ok(()) => warn!(
                queue,
                message_id = %letter.message_id,
                delivery_count = letter.delivery_count,
                reason,
                "message dead-lettered"
            ),
            Err(e) => error!(
                queue,
                message_id = %letter.message_id,
                error = %e,
                "failed to store dead letter, message dropped"
            ),
        }
    }

    /// Requeue the given outstanding deliveries, preserving their original
    /// order at the head of each queue, then dispatch the affected queues.
    fn requeue_tags(&mut self, tags: Vec<u64>) {
        let mut touched: Vec<String> = Vec::new();

        for tag in tags.into_iter().rev() {
            let Some(pending) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(session) = self.sessions.get_mut(&pending.session_id) {
                session.in_flight = session.in_flight.saturating_sub(1);
            }
            if !touched.contains(&pending.queue) {
                touched.push(pending.queue.clone());
            }
            self.requeue(&pending.queue, pending.envelope);
        }

        for queue in touched {
            self.dispatch(&queue);
        }
    }

    /// Remove a session, detach it from every queue and requeue whatever it
    /// had not yet acknowledged.
    pub fn cleanup_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);

        let id = session_id.to_string();
        for queue in self.queues.values_mut() {
            queue.remove_consumer(&id);
        }

        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, pending)| pending.session_id == session_id)
            .map(|(tag, _)| *tag)
            .collect();
        if !orphaned.is_empty() {
            info!(
                session = session_id,
                count = orphaned.len(),
                "requeueing unacknowledged deliveries"
            );
        }
        self.requeue_tags(orphaned);

        info!(session = session_id, "session cleaned up");
    }

    /// Requeue deliveries that have been outstanding for longer than
    /// `ack_timeout_ms`. Returns how many were requeued.
    pub fn requeue_expired(&mut self, now_ms: i64, ack_timeout_ms: i64) -> usize {
        let expired: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, pending)| now_ms - pending.delivered_at > ack_timeout_ms)
            .map(|(tag, _)| *tag)
            .collect();

        let count = expired.len();
        if count > 0 {
            warn!(count, "ack timeout expired, requeueing deliveries");
        }
        self.requeue_tags(expired);
        count
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.ready.len())
    }

    pub async fn start_redelivery_loop(broker: SharedBroker, ack_timeout: Duration) {
        let timeout_ms = i64::try_from(ack_timeout.as_millis()).unwrap_or(i64::MAX);
        loop {
            tokio::time::sleep(Duration::from_millis(Self::REDELIVERY_SCAN_MS)).await;

            let mut broker_lock = lock_broker(&broker);
            broker_lock.requeue_expired(Utc::now().timestamp_millis(), timeout_ms);
        }
    }
}
