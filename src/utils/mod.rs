//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `relaymq` application.
//!
//! It centralizes the error taxonomy shared by the broker, the queue client and
//! the worker, and the one-time logging setup used by the binary.

pub mod error;
pub mod logging;
