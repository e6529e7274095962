//! Pooled connections to the helm database file.
//!
//! The scheduler's jobs, the rate limiter and the approval gate all write
//! through one pool, so every connection runs in WAL mode and waits out
//! short write locks instead of failing with `SQLITE_BUSY`.

use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Pool of connections to one database file.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Pool sizing and lock handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// How long a statement waits on another connection's write lock.
    pub busy_timeout: Duration,
    /// How long a caller waits for a free connection.
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

/// Applied to every connection as the pool opens it.
#[derive(Debug)]
struct SessionSetup {
    busy_timeout: Duration,
}

impl CustomizeConnection<Connection, rusqlite::Error> for SessionSetup {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
    }
}

/// Open a pool over the database file at `path`, creating it if needed.
pub fn open_pool(path: &str, config: &PoolConfig) -> Result<ConnectionPool> {
    Ok(Pool::builder()
        .max_size(config.max_connections)
        .connection_timeout(config.checkout_timeout)
        .connection_customizer(Box::new(SessionSetup {
            busy_timeout: config.busy_timeout,
        }))
        .build(SqliteConnectionManager::file(path))?)
}
