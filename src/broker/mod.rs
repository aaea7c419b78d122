//! The broker: named queues with acknowledged, at-least-once delivery.
//!
//! Public types:
//! - `Broker`: core engine to register sessions, declare queues, publish,
//!   dispatch and settle deliveries.
//! - `Session`: one connected client as seen by the broker.
//!
//! The engine is transport-agnostic apart from the frames it pushes into each
//! session's channel; `transport::websocket` wires it to the network.

pub mod engine;
pub mod message;
pub mod queue;
pub mod session;

pub use engine::{Broker, SharedBroker, lock_broker};
pub use session::Session;
