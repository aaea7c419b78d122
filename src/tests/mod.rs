//! End-to-end tests that run the broker, the queue client, the worker and the
//! HTTP ingress together over real sockets.

pub mod support;
