//! The `persistence` module stores messages the broker gave up on.
//!
//! Poison messages (undecodable, or failing past the redelivery limit) are
//! moved out of their queue into a `sled` tree so they stop cycling through
//! consumers but stay available for inspection.

pub mod sled_store;

pub use sled_store::{DeadLetter, DeadLetterStore};
