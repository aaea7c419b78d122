//! The `client` module is the publishing and consuming side of the broker
//! protocol.
//!
//! `QueueClient` manages one connection: it declares queues, publishes
//! messages and opens a `Subscription` whose deliveries are settled with
//! ack / nack according to a handler's `Outcome`.

pub mod queue_client;

pub use queue_client::{Delivery, DeliveryHandler, Outcome, QueueClient, QueueInfo, Subscription};
