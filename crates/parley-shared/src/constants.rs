use std::time::Duration;

/// Idle read deadline; extended on every received frame and pong.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Heartbeat ping cadence. Must stay below [`READ_TIMEOUT`].
pub const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Deadline for writing a single outbound frame.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-session outbound event queue capacity
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the hub's inbound event channel
pub const BROADCAST_CAPACITY: usize = 256;

/// SQLite busy timeout; writers wait this long on lock contention.
pub const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Page cache size in KiB (negative pragma value = KiB), 64 MiB.
pub const DB_CACHE_SIZE_KIB: i64 = 64 * 1024;

pub const DB_MAX_OPEN: usize = 25;
pub const DB_MAX_IDLE: usize = 5;
pub const DB_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
