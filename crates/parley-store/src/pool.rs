//! Pooled SQLite connections.
//!
//! SQLite allows many readers but one writer at a time. The pool caps the
//! number of open handles, keeps a few idle ones warm and recycles handles
//! after a fixed lifetime. A checkout that finds the pool exhausted waits up
//! to the busy timeout before giving up with [`StoreError::PoolTimeout`].

use std::path::Path;
use std::time::Duration;

use parley_shared::constants::{
    DB_BUSY_TIMEOUT, DB_CACHE_SIZE_KIB, DB_MAX_IDLE, DB_MAX_LIFETIME, DB_MAX_OPEN,
};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::{Result, StoreError};

pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and per-connection pragmas.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of simultaneously open connections.
    pub max_open: usize,
    /// Connections kept open while unused.
    pub max_idle: usize,
    /// Connections older than this are closed; zero disables recycling.
    pub max_lifetime: Duration,
    /// SQLite busy timeout, also the longest a checkout waits.
    pub busy_timeout: Duration,
    /// Page cache size in KiB.
    pub cache_size_kib: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: DB_MAX_OPEN,
            max_idle: DB_MAX_IDLE,
            max_lifetime: DB_MAX_LIFETIME,
            busy_timeout: DB_BUSY_TIMEOUT,
            cache_size_kib: DB_CACHE_SIZE_KIB,
        }
    }
}

/// Build the pool for the database at `path`. Every connection it opens
/// runs [`configure`] first.
pub fn open_pool(path: &Path, config: &PoolConfig) -> Result<ConnectionPool> {
    let pragmas = config.clone();
    let manager =
        SqliteConnectionManager::file(path).with_init(move |conn| configure(conn, &pragmas));

    // r2d2 rejects zero sizes and timeouts, and idle above max.
    let max_size = config.max_open.clamp(1, u32::MAX as usize) as u32;
    let min_idle = (config.max_idle.min(max_size as usize)) as u32;
    let max_lifetime = Some(config.max_lifetime).filter(|d| !d.is_zero());
    let connection_timeout = config.busy_timeout.max(Duration::from_millis(1));

    r2d2::Pool::builder()
        .max_size(max_size)
        .min_idle(Some(min_idle))
        .max_lifetime(max_lifetime)
        .connection_timeout(connection_timeout)
        .build(manager)
        .map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "could not open connection pool");
            StoreError::PoolTimeout(connection_timeout)
        })
}

/// Check out a connection, waiting up to the pool's connection timeout.
pub(crate) fn checkout(pool: &ConnectionPool) -> Result<PooledConnection> {
    pool.get().map_err(|e| {
        tracing::warn!(error = %e, "database connection checkout failed");
        StoreError::PoolTimeout(pool.connection_timeout())
    })
}

/// Apply the pragmas every pooled connection runs with.
fn configure(conn: &mut Connection, config: &PoolConfig) -> rusqlite::Result<()> {
    conn.busy_timeout(config.busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -config.cache_size_kib)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_in(dir: &tempfile::TempDir, config: PoolConfig) -> ConnectionPool {
        open_pool(&dir.path().join("pool.db"), &config).unwrap()
    }

    #[test]
    fn pragmas_applied_to_new_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir, PoolConfig::default());
        let conn = checkout(&pool).unwrap();

        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let busy: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy, 5000);

        // NORMAL == 1
        let sync: i64 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 1);

        let cache: i64 = conn
            .pragma_query_value(None, "cache_size", |row| row.get(0))
            .unwrap();
        assert_eq!(cache, -65536);
    }

    #[test]
    fn sizing_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir, PoolConfig::default());

        assert_eq!(pool.max_size(), 25);
        assert_eq!(pool.min_idle(), Some(5));
        assert_eq!(pool.max_lifetime(), Some(Duration::from_secs(300)));
        assert_eq!(pool.connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn out_of_range_settings_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(
            &dir,
            PoolConfig {
                max_open: 0,
                max_idle: 10,
                max_lifetime: Duration::ZERO,
                ..PoolConfig::default()
            },
        );

        assert_eq!(pool.max_size(), 1);
        assert_eq!(pool.min_idle(), Some(1));
        assert_eq!(pool.max_lifetime(), None);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(
            &dir,
            PoolConfig {
                max_open: 1,
                busy_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        );

        let _held = checkout(&pool).unwrap();
        assert!(matches!(checkout(&pool), Err(StoreError::PoolTimeout(_))));
    }

    #[test]
    fn released_connection_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(
            &dir,
            PoolConfig {
                max_open: 1,
                ..PoolConfig::default()
            },
        );

        drop(checkout(&pool).unwrap());
        assert!(checkout(&pool).is_ok());
    }
}
