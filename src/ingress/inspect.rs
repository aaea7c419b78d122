use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::health_handler;
use crate::codec::Message;
use crate::sink::MessageSink;

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub count: usize,
    pub messages: Vec<Message>,
}

/// `GET /api/messages` lists what the consumer has stored so far.
pub fn router(sink: MessageSink) -> Router {
    Router::new()
        .route("/api/messages", get(messages_handler))
        .route("/health", get(health_handler))
        .with_state(sink)
}

async fn messages_handler(State(sink): State<MessageSink>) -> Json<MessagesResponse> {
    let messages = sink.list();
    Json(MessagesResponse {
        count: messages.len(),
        messages,
    })
}
