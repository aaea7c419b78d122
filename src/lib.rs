//! # RelayMQ
//!
//! `relaymq` relays text messages from an HTTP ingress, through a queue broker,
//! to a consumer that keeps them in memory. The broker speaks a small JSON
//! protocol over WebSockets and gives at-least-once delivery: every delivery
//! must be acknowledged, unacknowledged ones are redelivered, and messages that
//! keep failing are moved to a dead-letter store.
//!
//! ## Core Modules
//!
//! - `broker`: queues, sessions, dispatch and settlement of deliveries.
//! - `transport`: the WebSocket server and the frames it exchanges.
//! - `client`: a queue client for publishing and consuming over that protocol.
//! - `codec`: the message entity and its JSON wire form.
//! - `worker`: the long-lived consumer with reconnect backoff and a circuit breaker.
//! - `sink`: in-memory storage of consumed messages.
//! - `ingress`: the HTTP publish endpoint and the consumer's inspection endpoint.
//! - `persistence`: sled-backed dead-letter store.
//! - `config`: layered configuration (defaults, file, environment).
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod ingress;
pub mod persistence;
pub mod sink;
pub mod transport;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod tests;
