//! Request middleware for the Nexus server.
//!
//! Adapted from the teacher's `auth_middleware`
//! (`vaultrs-server/src/middleware.rs`): extracts the caller's verified
//! identity and injects it into request extensions for downstream handlers
//! to run policy checks against via [`nexus_core::facade::NexusCore::check_access`].

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::identity::{SpiffeIdentity, IDENTITY_HEADER};

/// Extracts the terminator-populated identity header and injects a
/// [`SpiffeIdentity`] into request extensions. Requests without the header
/// are rejected before reaching any handler.
///
/// Skips identity extraction for the unauthenticated health probe.
pub async fn identity_middleware(mut req: Request, next: Next) -> Response {
    if req.uri().path() == "/v1/operator/status" {
        return next.run(req).await;
    }

    let identity = req
        .headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| SpiffeIdentity(s.to_owned()));

    let Some(identity) = identity else {
        return (StatusCode::UNAUTHORIZED, axum::Json(serde_json::json!({"err": "unauthorized"}))).into_response();
    };

    req.extensions_mut().insert(identity);
    next.run(req).await
}
