//! The `transport` module is responsible for the broker's network protocol.
//!
//! It defines the frames exchanged between queue clients and the broker and
//! implements the WebSocket server that turns those frames into broker
//! operations.

pub mod message;
pub mod websocket;

pub use message::{ClientFrame, ServerFrame};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod websocket_tests;
