//! Consumer worker
//!
//! A single long-lived task that drains one queue into a callback:
//!
//! `Starting -> Connecting -> QueueReady -> Consuming -> (Stopped | Faulted)`
//!
//! Each delivery is decoded and passed to the callback. Success acks it;
//! a callback error nacks it with requeue so the broker redelivers it (and
//! dead-letters it once it runs out of deliveries); an undecodable payload is
//! rejected without requeue. Losing the connection sends the worker back to
//! `Connecting` after a backoff delay, gated by a circuit breaker. The worker
//! stops as soon as the shutdown signal flips, even mid-wait.

pub mod retry;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{Delivery, Outcome, QueueClient};
use crate::codec::{self, Message};
use crate::config::{BrokerSettings, WorkerSettings};
use crate::utils::error::QueueError;
use retry::Reconnect;

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Connecting,
    QueueReady,
    Consuming,
    Stopped,
    Faulted,
}

pub struct ConsumerWorker<F> {
    broker: BrokerSettings,
    policy: WorkerSettings,
    queue: String,
    callback: F,
    state: watch::Sender<WorkerState>,
}

impl<F> ConsumerWorker<F>
where
    F: FnMut(Message) -> Result<(), CallbackError>,
{
    pub fn new(
        broker: BrokerSettings,
        policy: WorkerSettings,
        queue: impl Into<String>,
        callback: F,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            broker,
            policy,
            queue: queue.into(),
            callback,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        debug!(?state, "worker state");
        self.state.send_replace(state);
    }

    /// Run until `shutdown` becomes `true` (ends `Stopped`) or until
    /// `max_attempts` consecutive connection attempts have failed (ends
    /// `Faulted`). Losing the connection of a session that reached its queue
    /// is not a failed attempt. Returns the final state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerState {
        let mut reconnect = Reconnect::from_settings(&self.policy);
        info!(queue = %self.queue, broker = %self.broker.url(), "consumer worker starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(remaining) = reconnect.breaker.allow() {
                warn!(
                    wait_ms = remaining.as_millis() as u64,
                    "circuit open, holding off reconnect"
                );
                if wait_or_shutdown(remaining, &mut shutdown).await {
                    break;
                }
                continue;
            }

            match self.session(&mut reconnect, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    // The queue was reached, so this is not a failed attempt.
                    self.set_state(WorkerState::Connecting);
                    let delay = reconnect.on_lost();
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "broker connection lost, reconnecting"
                    );
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
                SessionEnd::Failed(e) => {
                    self.set_state(WorkerState::Faulted);
                    let delay = reconnect.on_failure();
                    let attempts = reconnect.consecutive_failures;

                    if self.policy.max_attempts > 0 && attempts >= self.policy.max_attempts {
                        error!(error = %e, attempts, "consumer worker giving up");
                        return WorkerState::Faulted;
                    }

                    warn!(
                        error = %e,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "consumer session failed, reconnecting"
                    );
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::Stopped);
        info!(queue = %self.queue, "consumer worker stopped");
        WorkerState::Stopped
    }

    /// One connection's worth of consuming. Shutdown is observed during
    /// setup as well as while consuming.
    async fn session(
        &mut self,
        reconnect: &mut Reconnect,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        self.set_state(WorkerState::Connecting);
        let connect = QueueClient::connect(&self.broker);
        let mut client = match until_shutdown(connect, shutdown).await {
            None => return SessionEnd::Shutdown,
            Some(Err(e)) => return SessionEnd::Failed(e),
            Some(Ok(client)) => client,
        };

        let info = match until_shutdown(client.declare(&self.queue), shutdown).await {
            None => {
                client.close().await;
                return SessionEnd::Shutdown;
            }
            Some(Err(e)) => return SessionEnd::Failed(e),
            Some(Ok(info)) => info,
        };
        self.set_state(WorkerState::QueueReady);
        reconnect.on_connected();
        info!(queue = %info.queue, backlog = info.message_count, "queue ready");

        let consume = client.consume(&self.queue, self.policy.prefetch);
        let mut subscription = match until_shutdown(consume, shutdown).await {
            None => {
                client.close().await;
                return SessionEnd::Shutdown;
            }
            Some(Err(e)) => return SessionEnd::Failed(e),
            Some(Ok(subscription)) => subscription,
        };
        self.set_state(WorkerState::Consuming);

        let callback = &mut self.callback;
        let mut handler = |delivery: &Delivery| handle_delivery(callback, delivery);
        let result = subscription.run(&mut handler, shutdown).await;

        client.close().await;
        match result {
            Ok(()) => SessionEnd::Shutdown,
            Err(e) => SessionEnd::Lost(e),
        }
    }
}

/// How a session ended.
enum SessionEnd {
    Shutdown,
    /// The queue was declared, then the connection went away.
    Lost(QueueError),
    /// Connecting, declaring or subscribing failed.
    Failed(QueueError),
}

fn handle_delivery<F>(callback: &mut F, delivery: &Delivery) -> Outcome
where
    F: FnMut(Message) -> Result<(), CallbackError>,
{
    let message = match codec::decode(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "undecodable message, rejecting without requeue"
            );
            return Outcome::Nack { requeue: false };
        }
    };

    let id = message.id;
    match callback(message) {
        Ok(()) => {
            debug!(id = %id, redelivered = delivery.redelivered, "message processed");
            Outcome::Ack
        }
        Err(e) => {
            warn!(
                id = %id,
                delivery_count = delivery.delivery_count,
                error = %e,
                "callback failed, requeueing"
            );
            Outcome::Nack { requeue: true }
        }
    }
}

/// Sleep for `delay` unless shutdown is signalled first. Returns `true` when
/// the worker should stop.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown_requested(shutdown) => true,
    }
}

/// Drive `fut` to completion unless shutdown is signalled first.
async fn until_shutdown<T>(
    fut: impl Future<Output = Result<T, QueueError>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Result<T, QueueError>> {
    tokio::select! {
        res = fut => Some(res),
        _ = shutdown_requested(shutdown) => None,
    }
}

/// Resolves once shutdown is `true` or nobody can signal it any more.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
