//! Writer-side relay: the writer service posts an event envelope here after
//! its local commit and the relay publishes it to the exchange.

use super::{format_uptime, problem, Metrics};
use crate::broker::{Broker, Publisher};
use crate::event::DomainEvent;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct RelayState {
    pub publisher: Arc<dyn Publisher>,
    /// Checked by `/health`; absent in tests
    pub broker: Option<Arc<Broker>>,
    pub metrics: Metrics,
}

impl RelayState {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            broker: None,
            metrics: Metrics::new(),
        }
    }

    pub fn with_broker(mut self, broker: Arc<Broker>) -> Self {
        self.broker = Some(broker);
        self
    }
}

/// Response returned when an event is accepted for delivery.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(publish_event))
        .with_state(state)
}

async fn publish_event(State(state): State<Arc<RelayState>>, body: Bytes) -> Response {
    let event = match DomainEvent::from_envelope(&body) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Rejected envelope");
            return problem(StatusCode::BAD_REQUEST, "Invalid event", e.to_string());
        }
    };

    match state.publisher.publish(&event).await {
        Ok(receipt) => {
            state.metrics.increment_succeeded();
            (
                StatusCode::ACCEPTED,
                Json(PublishResponse {
                    message_id: receipt.message_id,
                    kind: receipt.kind.to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            state.metrics.increment_failed();
            error!(
                kind = %event.kind(),
                id = %event.question_id(),
                error = %e,
                "Failed to publish event"
            );
            problem(StatusCode::SERVICE_UNAVAILABLE, "Publish failed", e.to_string())
        }
    }
}

async fn health_check(State(state): State<Arc<RelayState>>) -> Response {
    match &state.broker {
        Some(broker) if !broker.is_connected() => {
            warn!("Broker connection lost");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "broker": "disconnected" })),
            )
                .into_response()
        }
        _ => Json(json!({ "status": "ok", "broker": "connected" })).into_response(),
    }
}

async fn get_metrics(State(state): State<Arc<RelayState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": format_uptime(uptime),
        "events": {
            "published": state.metrics.succeeded(),
            "failed": state.metrics.failed()
        },
        "status": "running"
    }))
}
