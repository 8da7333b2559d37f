//! Core engine for Nexus: the in-memory, versioned, soft-deletable secret
//! store with write-through persistence; the policy store and access-check
//! evaluator; the KEK manager and its background rotation/rewrap tasks; and
//! the bootstrap verification protocol. See `SPEC_FULL.md` for the full
//! component breakdown (C1–C10).

pub mod access;
pub mod bootstrap;
pub mod error;
pub mod facade;
pub mod kek;
pub mod kv;
pub mod persist;
pub mod policy;
pub mod scheduler;

pub use error::NexusError;
pub use facade::{NexusCore, NexusCoreConfig};
