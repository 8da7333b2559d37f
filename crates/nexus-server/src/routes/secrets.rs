//! Secret routes: `/v1/store/secrets*` (spec.md 6).
//!
//! A single `?action=` query parameter dispatches put/get/delete/undelete/
//! list over one route, following the source system's action-multiplexed
//! endpoint shape; handler bodies delegate straight to
//! [`nexus_core::facade::NexusCore`], adapting the teacher's
//! `routes/secrets.rs` policy-check-then-engine-call pattern.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use nexus_core::policy::Permission;

use crate::error::AppError;
use crate::identity::SpiffeIdentity;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/store/secrets", post(dispatch))
        .route("/v1/store/secrets/metadata", post(metadata))
}

#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub path: String,
    pub data: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct GetRequest {
    pub path: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub path: String,
    #[serde(default)]
    pub versions: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct GetResponse {
    pub data: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub path: String,
    pub current_version: u32,
    pub oldest_version: u32,
    pub max_versions: u32,
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    identity: SpiffeIdentity,
    Query(q): Query<ActionQuery>,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, AppError> {
    use axum::response::IntoResponse;

    match q.action.as_deref() {
        None | Some("put") => {
            let req: PutRequest = parse_body(&body)?;
            check(&state, &identity, &req.path, Permission::Write).await?;
            let entry = state.core.upsert_secret(&req.path, req.data).await?;
            Ok((axum::http::StatusCode::OK, Json(MetadataResponse {
                path: entry.path,
                current_version: entry.current_version,
                oldest_version: entry.oldest_version,
                max_versions: entry.max_versions,
            }))
            .into_response())
        }
        Some("get") => {
            let req: GetRequest = parse_body(&body)?;
            check(&state, &identity, &req.path, Permission::Read).await?;
            let data = state.core.get_secret(&req.path, req.version).await?;
            Ok(Json(GetResponse { data }).into_response())
        }
        Some("delete") => {
            let req: DeleteRequest = parse_body(&body)?;
            check(&state, &identity, &req.path, Permission::Write).await?;
            state.core.delete_secret(&req.path, &req.versions).await?;
            Ok(axum::http::StatusCode::OK.into_response())
        }
        Some("undelete") => {
            let req: DeleteRequest = parse_body(&body)?;
            check(&state, &identity, &req.path, Permission::Write).await?;
            state.core.undelete_secret(&req.path, &req.versions).await?;
            Ok(axum::http::StatusCode::OK.into_response())
        }
        Some("list") => {
            check(&state, &identity, "*", Permission::List).await?;
            let keys = state.core.list_keys().await;
            Ok(Json(ListResponse { keys }).into_response())
        }
        Some(other) => Err(AppError::from(nexus_core::NexusError::BadInput(format!("unknown action: {other}")))),
    }
}

async fn metadata(
    State(state): State<Arc<AppState>>,
    identity: SpiffeIdentity,
    Json(req): Json<GetRequest>,
) -> Result<Json<MetadataResponse>, AppError> {
    check(&state, &identity, &req.path, Permission::Read).await?;
    let entry = state.core.get_raw_secret(&req.path).await?;
    Ok(Json(MetadataResponse {
        path: entry.path,
        current_version: entry.current_version,
        oldest_version: entry.oldest_version,
        max_versions: entry.max_versions,
    }))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::from(nexus_core::NexusError::BadInput(format!("invalid request body: {e}"))))
}

async fn check(
    state: &AppState,
    identity: &SpiffeIdentity,
    path: &str,
    permission: Permission,
) -> Result<(), AppError> {
    let required = HashSet::from([permission]);
    if state.core.check_access(identity.as_str(), path, &required).await {
        Ok(())
    } else {
        Err(AppError::from(nexus_core::NexusError::Unauthorized(format!(
            "{} lacks {permission:?} on {path}",
            identity.as_str()
        ))))
    }
}
