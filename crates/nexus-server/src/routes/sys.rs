//! Operator status route: `/v1/operator/status` (spec.md 6).
//!
//! No auth required — the health probe runs before any identity extractor
//! middleware (see [`crate::middleware::identity_middleware`]).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/operator/status", get(status))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub healthy: bool,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.core.health_check().await;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(StatusResponse { healthy }))
}
