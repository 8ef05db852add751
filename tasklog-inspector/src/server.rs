//! HTTP server for the inspector.

use axum::{extract::State, response::Json, routing::get, Router};
use std::sync::Arc;
use tasklog::{LedgerHandle, QueueSnapshot};
use tracing::info;

/// Shared state for the inspector server.
pub struct InspectorState {
    pub ledger: LedgerHandle,
}

/// Create the router for the inspector.
pub fn create_router(state: Arc<InspectorState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/ledger", get(serve_ledger))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn serve_ledger(State(state): State<Arc<InspectorState>>) -> Json<Vec<QueueSnapshot>> {
    Json(state.ledger.snapshot().await)
}

/// Start the inspector server.
pub async fn run_server(state: Arc<InspectorState>, port: u16) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port, "Inspector listening");

    axum::serve(listener, app).await
}
