//! Bootstrap verification route: `/v1/bootstrap/verify` (spec.md 6, 4.9).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use nexus_core::bootstrap::BootstrapRequest;

use crate::error::AppError;
use crate::identity::SpiffeIdentity;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/bootstrap/verify", post(verify))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// Exactly 12 bytes.
    pub nonce: Vec<u8>,
    /// At most 1024 bytes.
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub digest: String,
}

async fn verify(
    State(state): State<Arc<AppState>>,
    identity: SpiffeIdentity,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    let digest = state
        .core
        .bootstrap_verify(identity.as_str(), &BootstrapRequest { nonce: req.nonce, ciphertext: req.ciphertext })
        .await?;
    Ok(Json(VerifyResponse { digest }))
}
