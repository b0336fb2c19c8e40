#![deny(missing_docs)]
//! loc_core: shared building blocks (config, KV, logging, job model).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Typed errors for fix acquisition and scheduling.
pub mod error;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Shared job model used by the scheduler, sample job and tools.
pub mod job;
