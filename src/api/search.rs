//! Reader HTTP API: `/search`, `/health` and `/metrics`.

use super::{format_uptime, problem, Metrics};
use crate::broker::{ConsumerStats, QueueDepth};
use crate::config::MAX_PAGE_SIZE;
use crate::index::{SearchDocument, SearchIndex};
use crate::query;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct SearchState {
    pub index: Arc<dyn SearchIndex>,
    pub collection: String,
    /// Results per request when the caller gives no `limit`
    pub page_size: usize,
    pub consumer_stats: Arc<ConsumerStats>,
    /// Absent when running without a broker
    pub dead_letters: Option<Arc<dyn QueueDepth>>,
    pub metrics: Metrics,
}

impl SearchState {
    pub fn new(index: Arc<dyn SearchIndex>, collection: &str, page_size: usize) -> Self {
        Self {
            index,
            collection: collection.to_string(),
            page_size,
            consumer_stats: Arc::new(ConsumerStats::new()),
            dead_letters: None,
            metrics: Metrics::new(),
        }
    }

    pub fn with_consumer(
        mut self,
        stats: Arc<ConsumerStats>,
        dead_letters: Option<Arc<dyn QueueDepth>>,
    ) -> Self {
        self.consumer_stats = stats;
        self.dead_letters = dead_letters;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    query: Option<String>,
    limit: Option<usize>,
}

pub fn search_router(state: Arc<SearchState>) -> Router {
    Router::new()
        .route("/search", get(search))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

async fn search(
    State(state): State<Arc<SearchState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchDocument>>, Response> {
    let Some(raw) = params.query else {
        return Err(problem(
            StatusCode::BAD_REQUEST,
            "Missing query",
            "the 'query' parameter is required",
        ));
    };

    let limit = params
        .limit
        .unwrap_or(state.page_size)
        .clamp(1, MAX_PAGE_SIZE);
    let parsed = query::parse(&raw);
    debug!(query = %raw, text = %parsed.text, tag = ?parsed.tag, limit = limit, "Search request");

    match state
        .index
        .search(&state.collection, &parsed.to_search_query(limit))
        .await
    {
        Ok(documents) => {
            state.metrics.increment_succeeded();
            Ok(Json(documents))
        }
        Err(e) => {
            state.metrics.increment_failed();
            error!(query = %raw, error = %e, "Search failed");
            Err(problem(
                StatusCode::SERVICE_UNAVAILABLE,
                "Search failed",
                e.to_string(),
            ))
        }
    }
}

async fn health_check(State(state): State<Arc<SearchState>>) -> Response {
    match state.index.health().await {
        Ok(()) => Json(json!({ "status": "ok", "index": "reachable" })).into_response(),
        Err(e) => {
            warn!(error = %e, "Search index health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "index": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn get_metrics(State(state): State<Arc<SearchState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();
    let events = state.consumer_stats.snapshot();

    let dead_letter_depth = match &state.dead_letters {
        Some(dlq) => match dlq.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(queue = %dlq.queue(), error = %e, "Failed to read dead-letter queue depth");
                None
            }
        },
        None => None,
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": format_uptime(uptime),
        "events": {
            "acked": events.acked,
            "retried": events.retried,
            "dead_lettered": events.dead_lettered
        },
        "searches": {
            "served": state.metrics.succeeded(),
            "failed": state.metrics.failed()
        },
        "dead_letter_depth": dead_letter_depth,
        "status": "running"
    }))
}
