//! Policy routes: `/v1/acl/policy` (spec.md 6).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use nexus_core::policy::{Permission, Policy};

use crate::error::AppError;
use crate::identity::SpiffeIdentity;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/acl/policy", post(put).get(get_or_list).delete(delete))
}

#[derive(Debug, Deserialize)]
pub struct PutPolicyRequest {
    pub id: String,
    pub name: String,
    pub spiffe_id_pattern: String,
    pub path_pattern: String,
    pub permissions: HashSet<Permission>,
}

#[derive(Debug, Deserialize)]
pub struct PolicyIdQuery {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    pub id: String,
    pub name: String,
    pub spiffe_id_pattern: String,
    pub path_pattern: String,
    pub permissions: HashSet<Permission>,
}

impl From<Policy> for PolicyResponse {
    fn from(p: Policy) -> Self {
        Self { id: p.id, name: p.name, spiffe_id_pattern: p.spiffe_id_pattern, path_pattern: p.path_pattern, permissions: p.permissions }
    }
}

#[derive(Debug, Serialize)]
pub struct PolicyListResponse {
    pub policies: Vec<PolicyResponse>,
}

async fn put(
    State(state): State<Arc<AppState>>,
    identity: SpiffeIdentity,
    Json(req): Json<PutPolicyRequest>,
) -> Result<StatusCode, AppError> {
    require_super(&state, &identity).await?;

    let policy = Policy {
        id: req.id,
        name: req.name,
        spiffe_id_pattern: req.spiffe_id_pattern,
        path_pattern: req.path_pattern,
        permissions: req.permissions,
        created_at: Utc::now(),
    };
    state.core.put_policy(policy).await?;
    Ok(StatusCode::OK)
}

async fn get_or_list(
    State(state): State<Arc<AppState>>,
    identity: SpiffeIdentity,
    Query(q): Query<PolicyIdQuery>,
) -> Result<axum::response::Response, AppError> {
    use axum::response::IntoResponse;

    require_super(&state, &identity).await?;

    match q.id {
        Some(id) => {
            let policy = state
                .core
                .get_policy(&id)
                .await
                .ok_or_else(|| AppError::from(nexus_core::NexusError::NotFound(format!("policy {id} not found"))))?;
            Ok(Json(PolicyResponse::from(policy)).into_response())
        }
        None => {
            let policies = state.core.list_policies().await.into_iter().map(PolicyResponse::from).collect();
            Ok(Json(PolicyListResponse { policies }).into_response())
        }
    }
}

async fn delete(
    State(state): State<Arc<AppState>>,
    identity: SpiffeIdentity,
    Query(q): Query<PolicyIdQuery>,
) -> Result<StatusCode, AppError> {
    require_super(&state, &identity).await?;
    let id = q.id.ok_or_else(|| AppError::from(nexus_core::NexusError::BadInput("missing id".into())))?;
    state.core.delete_policy(&id).await?;
    Ok(StatusCode::OK)
}

/// Policy administration itself requires the `super` permission on the
/// reserved `sys/acl/policy` path.
async fn require_super(state: &AppState, identity: &SpiffeIdentity) -> Result<(), AppError> {
    let required = HashSet::from([Permission::Super]);
    if state.core.check_access(identity.as_str(), "sys/acl/policy", &required).await {
        Ok(())
    } else {
        Err(AppError::from(nexus_core::NexusError::Unauthorized(format!(
            "{} lacks super permission for policy administration",
            identity.as_str()
        ))))
    }
}
