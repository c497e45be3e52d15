//! Database connection management

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use super::migrations;

/// Default bound on how long a writer waits for the exclusive lock
/// before the call fails with `Busy`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database wrapper for `SQLite` connections
///
/// All report mutation runs through immediate (write-locked)
/// transactions on this connection; the busy timeout bounds lock waits
/// so contention surfaces as a retryable error instead of a hang.
pub struct Database {
    conn: Connection,
    busy_timeout: Duration,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a database with a caller-chosen lock-wait bound
    pub fn open_with_busy_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, timeout)
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        let database = Self { conn, busy_timeout };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for concurrent writers
    fn configure(&self) -> Result<()> {
        // WAL keeps readers off the writer's lock (no effect in memory)
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL").ok();
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(self.busy_timeout)?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference, required to start a transaction
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
