use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;

use crate::error::StoreError;
use crate::store::Deadline;

/// Bump when the schema changes. Key material is not disposable, so a
/// mismatch is refused rather than wiped.
const SCHEMA_VERSION: i64 = 1;

/// Statements between progress-handler callbacks. Small enough that a
/// runaway statement notices its deadline within a few milliseconds.
const PROGRESS_INTERVAL_OPS: i32 = 1_000;

/// Fixed-size pool of connections to one `SQLite` database.
///
/// Constructed once at startup and handed to the store; every worker thread
/// checks a connection out for the duration of one store call.
pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    returned: Condvar,
    size: usize,
}

impl ConnectionPool {
    /// Open (or create) the database at `path` with `size` connections and run
    /// the schema migration.
    ///
    /// `:memory:` databases are private to one connection, so the pool is
    /// clamped to a single connection for them.
    pub fn open(path: &Path, size: usize) -> Result<Self, StoreError> {
        let in_memory = path.as_os_str() == ":memory:";
        let size = if in_memory { 1 } else { size.max(1) };
        if in_memory {
            tracing::debug!("in-memory database, pool clamped to one connection");
        }

        let first = open_connection(path)?;
        migrate(&first)?;

        let mut idle = Vec::with_capacity(size);
        idle.push(first);
        for _ in 1..size {
            idle.push(open_connection(path)?);
        }

        tracing::info!(path = %path.display(), size, "database pool ready");

        Ok(Self {
            idle: Mutex::new(idle),
            returned: Condvar::new(),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Borrow a connection until the returned guard is dropped.
    ///
    /// Waits for a free connection no longer than `deadline`. The connection
    /// comes back armed: its busy timeout is the time remaining and a progress
    /// handler interrupts any statement still running at the deadline.
    pub fn checkout(&self, deadline: &Deadline) -> Result<PooledConnection<'_>, StoreError> {
        deadline.check()?;

        let conn = {
            let mut idle = self.idle.lock();
            loop {
                if let Some(conn) = idle.pop() {
                    break conn;
                }
                if self
                    .returned
                    .wait_until(&mut idle, deadline.instant())
                    .timed_out()
                    && idle.is_empty()
                {
                    tracing::warn!(
                        size = self.size,
                        "timed out waiting for a pooled connection"
                    );
                    return Err(StoreError::DeadlineExceeded);
                }
            }
        };

        let guard = PooledConnection {
            pool: self,
            conn: Some(conn),
        };
        guard.arm(deadline)?;
        Ok(guard)
    }

    fn put_back(&self, conn: Connection) {
        self.idle.lock().push(conn);
        self.returned.notify_one();
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl PooledConnection<'_> {
    fn arm(&self, deadline: &Deadline) -> Result<(), StoreError> {
        let remaining = deadline.check()?;
        self.busy_timeout(remaining)?;
        let stop_at: Instant = deadline.instant();
        self.progress_handler(
            PROGRESS_INTERVAL_OPS,
            Some(move || Instant::now() >= stop_at),
        );
        Ok(())
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.progress_handler(0, None::<fn() -> bool>);
            if let Err(e) = conn.busy_timeout(Duration::ZERO) {
                tracing::warn!(error = %e, "failed to reset busy timeout on pooled connection");
            }
            self.pool.put_back(conn);
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Schema(format!("failed to open database: {e}")))?;

    // WAL lets readers proceed while one writer holds the lock.
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| StoreError::Schema(format!("failed to set WAL mode: {e}")))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| StoreError::Schema(format!("failed to enable foreign keys: {e}")))?;

    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| StoreError::Schema(format!("failed to read schema version: {e}")))?;

    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current != 0 {
        return Err(StoreError::Schema(format!(
            "database schema version {current} is not supported (expected {SCHEMA_VERSION})"
        )));
    }

    tracing::info!(version = SCHEMA_VERSION, "creating key directory schema");
    conn.execute_batch(SCHEMA)
        .map_err(|e| StoreError::Schema(format!("failed to run schema: {e}")))?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| StoreError::Schema(format!("failed to set schema version: {e}")))?;
    Ok(())
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id TEXT PRIMARY KEY,
    public_key BLOB NOT NULL CHECK(length(public_key) = 32),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS signed_prekeys (
    user_id TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL CHECK(length(public_key) = 32),
    signature BLOB NOT NULL CHECK(length(signature) = 64),
    created_at INTEGER NOT NULL,
    -- Rewritten on every upsert; orders rows that share a created_at.
    seq INTEGER NOT NULL,
    PRIMARY KEY (user_id, key_id)
);

CREATE INDEX IF NOT EXISTS idx_signed_prekeys_latest
    ON signed_prekeys(user_id, created_at DESC, seq DESC);

CREATE TABLE IF NOT EXISTS one_time_prekeys (
    user_id TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL CHECK(length(public_key) = 32),
    used INTEGER NOT NULL DEFAULT 0 CHECK(used IN (0, 1)),
    created_at INTEGER NOT NULL,
    claimed_at INTEGER,
    PRIMARY KEY (user_id, key_id)
);

CREATE INDEX IF NOT EXISTS idx_one_time_prekeys_unused
    ON one_time_prekeys(user_id, used, created_at);

-- A consumed one-time pre-key never becomes claimable again.
CREATE TRIGGER IF NOT EXISTS one_time_prekeys_used_is_terminal
BEFORE UPDATE OF used ON one_time_prekeys
WHEN OLD.used = 1 AND NEW.used = 0
BEGIN
    SELECT RAISE(ABORT, 'one-time pre-key already consumed');
END;
";
