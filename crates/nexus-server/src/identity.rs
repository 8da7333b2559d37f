//! SPIFFE identity extraction.
//!
//! The mTLS terminator and SPIFFE-identity extractor are out of scope
//! (spec.md 1): in production this service sits behind a sidecar or gateway
//! that performs the mutual-TLS handshake and forwards the verified peer
//! identity. This module defines the thin boundary contract the rest of the
//! server consumes; [`crate::middleware`] populates it per request.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A verified SPIFFE identity presented by the mTLS terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeIdentity(pub String);

impl SpiffeIdentity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Header a trusted terminator/sidecar populates with the peer's verified
/// SPIFFE URI after completing the mTLS handshake.
pub const IDENTITY_HEADER: &str = "X-Nexus-Spiffe-Id";

impl<S> FromRequestParts<S> for SpiffeIdentity
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SpiffeIdentity>()
            .cloned()
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"err": "unauthorized"})),
                )
                    .into_response()
            })
    }
}
