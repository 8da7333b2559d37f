//! KEK management routes: `/v1/kek/{rotate,current,list,stats}` (spec.md 6).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use nexus_core::policy::Permission;

use crate::error::AppError;
use crate::identity::SpiffeIdentity;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/kek/rotate", post(rotate))
        .route("/v1/kek/current", get(current))
        .route("/v1/kek/list", get(list))
        .route("/v1/kek/stats", get(stats))
}

#[derive(Debug, Serialize)]
pub struct KekInfoResponse {
    pub id: String,
    pub version: u32,
    pub wraps_count: u64,
    pub status: String,
}

impl From<nexus_core::kek::KekInfo> for KekInfoResponse {
    fn from(k: nexus_core::kek::KekInfo) -> Self {
        Self { id: k.id, version: k.version, wraps_count: k.wraps_count, status: format!("{:?}", k.status).to_lowercase() }
    }
}

#[derive(Debug, Serialize)]
pub struct KekListResponse {
    pub keks: Vec<KekInfoResponse>,
}

#[derive(Debug, Serialize)]
pub struct KekStatsResponse {
    pub current_kek_id: String,
    pub total_keks: usize,
}

async fn rotate(State(state): State<Arc<AppState>>, identity: SpiffeIdentity) -> Result<Json<KekInfoResponse>, AppError> {
    require_super(&state, &identity).await?;
    let info = state.core.kek().rotate().await?;
    Ok(Json(KekInfoResponse::from(info)))
}

async fn current(State(state): State<Arc<AppState>>, identity: SpiffeIdentity) -> Result<Json<KekInfoResponse>, AppError> {
    require_super(&state, &identity).await?;
    let id = state.core.kek().current_kek_id().await;
    let info = state
        .core
        .kek()
        .info(&id)
        .await
        .ok_or_else(|| AppError::from(nexus_core::NexusError::Internal("active kek missing from registry".into())))?;
    Ok(Json(KekInfoResponse::from(info)))
}

async fn list(State(state): State<Arc<AppState>>, identity: SpiffeIdentity) -> Result<Json<KekListResponse>, AppError> {
    require_super(&state, &identity).await?;
    let keks = state.core.kek().list().await.into_iter().map(KekInfoResponse::from).collect();
    Ok(Json(KekListResponse { keks }))
}

async fn stats(State(state): State<Arc<AppState>>, identity: SpiffeIdentity) -> Result<Json<KekStatsResponse>, AppError> {
    require_super(&state, &identity).await?;
    let keks = state.core.kek().list().await;
    Ok(Json(KekStatsResponse { current_kek_id: state.core.kek().current_kek_id().await, total_keks: keks.len() }))
}

async fn require_super(state: &AppState, identity: &SpiffeIdentity) -> Result<(), AppError> {
    let required = HashSet::from([Permission::Super]);
    if state.core.check_access(identity.as_str(), "sys/kek", &required).await {
        Ok(())
    } else {
        Err(AppError::from(nexus_core::NexusError::Unauthorized(format!(
            "{} lacks super permission for kek administration",
            identity.as_str()
        ))))
    }
}
