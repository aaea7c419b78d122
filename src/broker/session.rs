//! Session representation
//!
//! `Session` models one connected client and holds the sending side of a
//! per-connection channel used by the broker to push frames. The
//! `authenticated` flag is set by the transport after a successful login.

use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub sender: UnboundedSender<WsMessage>,
    pub authenticated: bool,
    /// Queue and consumer tag, once the session has started consuming.
    pub consuming: Option<(String, String)>,
    pub prefetch: usize,
    pub in_flight: usize,
}

impl Session {
    /// Create a new session with a sender channel. The `id` is a UUID used
    /// to identify the session across broker operations.
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            authenticated: false,
            consuming: None,
            prefetch: 1,
            in_flight: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.consuming.is_some() && self.in_flight < self.prefetch
    }
}
