//! Store handle and bootstrap.
//!
//! The [`Store`] struct owns the connection pool and guarantees that
//! migrations have run before any other operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::migrations;
use crate::pool::{self, ConnectionPool, PoolConfig, PooledConnection};

/// Cloneable handle to the message database.
#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
    path: Arc<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. Safe to call against an existing database.
    pub fn open(path: &Path, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(
            path = %path.display(),
            max_open = config.max_open,
            max_idle = config.max_idle,
            "opening message store"
        );

        let pool = pool::open_pool(path, &config)?;
        {
            let conn = pool::checkout(&pool)?;
            migrations::run_migrations(&conn)?;
        }

        Ok(Self {
            pool,
            path: Arc::new(path.to_path_buf()),
        })
    }

    /// Check out a pooled connection.
    ///
    /// Callers should prefer the typed helpers, but direct access is
    /// occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> Result<PooledConnection> {
        pool::checkout(&self.pool)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
