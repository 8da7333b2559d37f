//! HTTP route wiring, configuration, and process hardening for the Nexus
//! server binary. The core secret/policy/KEK engine lives in `nexus-core`;
//! this crate is the thin Axum layer spec.md 1 calls "out of scope" for the
//! core but SPEC_FULL.md carries as the ambient HTTP surface.

pub mod config;
pub mod error;
pub mod hardening;
pub mod identity;
pub mod middleware;
pub mod routes;
pub mod state;
