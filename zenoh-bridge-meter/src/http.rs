//! HTTP server for the metrics endpoint and the snapshot API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::poller::wait_for_shutdown;
use crate::reading::RegisterRecord;
use crate::sinks::{CONTENT_TYPE, MetricsSink, SnapshotStore};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<MetricsSink>,
}

/// Create the HTTP router.
fn create_router(
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<MetricsSink>,
    metrics_path: &str,
) -> Router {
    let state = AppState { snapshots, metrics };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/api/data", get(data_handler))
        .route("/api/topics", get(topics_handler))
        .route("/api/topic/:name", get(topic_handler))
        .route("/api/topic/:name/value", get(value_handler))
        .route("/api/topic/:name/unit", get(unit_handler))
        .route("/api/topic/:name/raw", get(raw_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed\n").into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Whole snapshot.
async fn data_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshots.load();
    Json(snapshot.as_ref().clone()).into_response()
}

async fn topics_handler(State(state): State<AppState>) -> Response {
    let topics = state.snapshots.load().topics();
    Json(json!({ "count": topics.len(), "topics": topics })).into_response()
}

async fn topic_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let snapshot = state.snapshots.load();
    match snapshot.registers.get(&name) {
        Some(record) => Json(json!({
            "topic": name,
            "data": record,
            "timestamp": snapshot.timestamp,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Topic not found",
                "topic": name,
                "available_topics": snapshot.topics(),
            })),
        )
            .into_response(),
    }
}

async fn value_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    // Debug keeps a trailing ".0" on whole numbers.
    field_response(&state, &name, |record| format!("{:?}", record.value))
}

async fn unit_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    field_response(&state, &name, |record| record.unit.clone())
}

async fn raw_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    field_response(&state, &name, |record| record.raw_value.to_string())
}

/// Plain-text view of one field of a register.
fn field_response(
    state: &AppState,
    name: &str,
    field: impl FnOnce(&RegisterRecord) -> String,
) -> Response {
    let snapshot = state.snapshots.load();
    match snapshot.registers.get(name) {
        Some(record) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            field(record),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, format!("Topic '{}' not found", name)).into_response(),
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<MetricsSink>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        metrics: Arc<MetricsSink>,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            snapshots,
            metrics,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.snapshots, self.metrics, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            metrics_path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                wait_for_shutdown(&mut shutdown).await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
