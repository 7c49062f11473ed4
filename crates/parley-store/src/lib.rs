//! # parley-store
//!
//! Persistence gateway for the messaging hub, backed by SQLite.
//!
//! The crate exposes a cloneable, synchronous [`Store`] handle over a small
//! r2d2 connection pool. Every connection runs in WAL mode with a busy timeout so
//! readers proceed during writes and writers queue instead of failing. Async
//! callers are expected to wrap calls in `spawn_blocking`.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod pool;

mod error;

pub use database::Store;
pub use error::{Result, StoreError};
pub use models::*;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
