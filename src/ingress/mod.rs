//! HTTP surfaces.
//!
//! - [`router`]: the ingress. `POST /api/publish` validates a JSON body,
//!   stamps it into a [`Message`] and hands it to a [`MessagePublisher`].
//! - [`inspect::router`]: the consumer side's read-only view of its sink.

pub mod inspect;
pub mod publisher;


use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::Message;
pub use publisher::{BrokerPublisher, MessagePublisher};

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: String,
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

fn http_error(status: StatusCode, error: impl Into<String>) -> HttpError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

pub fn router<P: MessagePublisher>(publisher: Arc<P>) -> Router {
    Router::new()
        .route("/api/publish", post(publish_handler::<P>))
        .route("/health", get(health_handler))
        .with_state(publisher)
}

async fn publish_handler<P: MessagePublisher>(
    State(publisher): State<Arc<P>>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Json<PublishResponse>, HttpError> {
    let content = match payload {
        Ok(Json(PublishRequest {
            content: Some(content),
        })) if !content.trim().is_empty() => content,
        Ok(_) => return Err(http_error(StatusCode::BAD_REQUEST, "Invalid message")),
        Err(rejection) => {
            warn!(error = %rejection, "rejected publish request");
            return Err(http_error(StatusCode::BAD_REQUEST, "Invalid message"));
        }
    };

    let message = Message::new(content);
    if let Err(e) = publisher.publish(&message).await {
        warn!(id = %message.id, error = %e, "failed to publish message");
        return Err(http_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Failed to publish message: {e}"),
        ));
    }

    info!(id = %message.id, "message published");
    Ok(Json(PublishResponse {
        status: "Message published".to_string(),
        id: message.id,
    }))
}

pub(crate) async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
