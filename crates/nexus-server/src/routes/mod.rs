//! HTTP route handlers for Nexus.
//!
//! Routes are organized by subsystem, mirroring spec.md 6's endpoint table:
//! - `secrets`: versioned secret put/get/delete/undelete/list
//! - `policy`: policy CRUD
//! - `kek`: KEK rotate/current/list/stats
//! - `bootstrap`: proof-of-possession verification
//! - `sys`: operator health status

pub mod bootstrap;
pub mod kek;
pub mod policy;
pub mod secrets;
pub mod sys;
