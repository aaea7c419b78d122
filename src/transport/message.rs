//! Frames exchanged between queue clients and the broker.
//!
//! Every frame is a JSON text message tagged by `type`. Requests that expect
//! an answer (`login`, `declare`, `publish`, `consume`) get exactly one reply
//! frame, either the matching `*_ok` or `error`. `ack` and `nack` are never
//! answered; `deliver` frames arrive whenever the broker dispatches.

use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        username: String,
        password: String,
    },
    Declare {
        queue: String,
    },
    Publish {
        queue: String,
        body: String,
    },
    Consume {
        queue: String,
        prefetch: Option<u16>,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    LoginOk {},
    DeclareOk {
        queue: String,
        message_count: usize,
        consumer_count: usize,
    },
    PublishOk {
        queue: String,
    },
    ConsumeOk {
        consumer_tag: String,
    },
    Deliver {
        consumer_tag: String,
        delivery_tag: u64,
        queue: String,
        body: String,
        redelivered: bool,
        delivery_count: u32,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn to_ws(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }
}

impl ClientFrame {
    pub fn to_ws(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }
}
