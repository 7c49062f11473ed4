//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{BROADCAST_CAPACITY, DEFAULT_HTTP_PORT};
use parley_store::PoolConfig;

use crate::auth::StaticTokens;
use crate::session::SessionConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for HTTP and the `/ws` upgrade.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Bearer tokens accepted at upgrade time.
    /// Env: `AUTH_TOKENS` (`token:user_id,token:user_id`)
    /// Default: none, every upgrade is refused.
    pub auth_tokens: StaticTokens,

    /// Connection pool sizing.
    /// Env: `DB_MAX_OPEN`, `DB_MAX_IDLE`, `DB_MAX_LIFETIME_SECS`
    pub pool: PoolConfig,

    /// Per-session keep-alive and queue settings.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    pub session: SessionConfig,

    /// Capacity of the hub's inbound event channel.
    /// Env: `BROADCAST_CAPACITY`
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            auth_tokens: StaticTokens::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            broadcast_capacity: BROADCAST_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            config.http_addr = parse_or(&addr, "HTTP_ADDR", config.http_addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = PathBuf::from(path);
            }
        }

        if let Some(spec) = lookup("AUTH_TOKENS") {
            match StaticTokens::parse(&spec) {
                Ok(tokens) => config.auth_tokens = tokens,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid AUTH_TOKENS, no tokens loaded");
                }
            }
        }

        if let Some(val) = lookup("DB_MAX_OPEN") {
            config.pool.max_open = parse_or(&val, "DB_MAX_OPEN", config.pool.max_open);
        }

        if let Some(val) = lookup("DB_MAX_IDLE") {
            config.pool.max_idle = parse_or(&val, "DB_MAX_IDLE", config.pool.max_idle);
        }

        if let Some(val) = lookup("DB_MAX_LIFETIME_SECS") {
            let secs = parse_or(&val, "DB_MAX_LIFETIME_SECS", config.pool.max_lifetime.as_secs());
            config.pool.max_lifetime = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("OUTBOUND_QUEUE_CAPACITY") {
            config.session.outbound_capacity = parse_or(
                &val,
                "OUTBOUND_QUEUE_CAPACITY",
                config.session.outbound_capacity,
            );
        }

        if let Some(val) = lookup("BROADCAST_CAPACITY") {
            config.broadcast_capacity =
                parse_or(&val, "BROADCAST_CAPACITY", config.broadcast_capacity);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_or<T: FromStr + Copy>(raw: &str, name: &str, default: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::auth::TokenResolver;
    use parley_shared::types::UserId;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.database_path, PathBuf::from("./parley.db"));
        assert_eq!(config.pool.max_open, 25);
        assert_eq!(config.pool.max_idle, 5);
        assert_eq!(config.pool.max_lifetime, Duration::from_secs(300));
        assert_eq!(config.session.outbound_capacity, 256);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.auth_tokens.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/var/lib/parley/chat.db"),
            ("AUTH_TOKENS", "alpha:1,beta:2"),
            ("DB_MAX_OPEN", "8"),
            ("DB_MAX_LIFETIME_SECS", "60"),
            ("OUTBOUND_QUEUE_CAPACITY", "32"),
        ]);

        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, PathBuf::from("/var/lib/parley/chat.db"));
        assert_eq!(config.pool.max_open, 8);
        assert_eq!(config.pool.max_lifetime, Duration::from_secs(60));
        assert_eq!(config.session.outbound_capacity, 32);
        assert_eq!(config.auth_tokens.resolve("beta"), Some(UserId(2)));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("DB_MAX_IDLE", "many"),
            ("BROADCAST_CAPACITY", "-1"),
            ("AUTH_TOKENS", "missing-colon"),
        ]);

        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.pool.max_idle, 5);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.auth_tokens.is_empty());
    }
}
