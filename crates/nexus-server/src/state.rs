//! Shared application state for the Nexus server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`, following the teacher's `AppState` convention
//! (`vaultrs-server/src/state.rs`) collapsed onto the [`NexusCore`] facade
//! per SPEC_FULL.md's "Global mutable singletons" design note.

use std::sync::Arc;

use nexus_core::NexusCore;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The core secret/policy/KEK engine. Owns the bootstrap identity check
    /// internally (see [`NexusCore::bootstrap_verify`]).
    pub core: Arc<NexusCore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
