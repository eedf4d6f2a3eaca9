//! L1: `LocalWAL`, a `rusqlite`-backed write-ahead log that gives the rest
//! of the stack atomic multi-key commits on top of an L0 object store that
//! only promises atomic single-key puts (§4.5).
//!
//! A commit appends its writes to the WAL database and returns as soon as
//! that append is durable — the object store catch-up happens on a
//! background drain thread. `Start` applies back-pressure once the number
//! of undrained commits crosses `high_water_mark`, blocking the caller (or
//! returning `BackPressure` if its `CancelToken` fires first) rather than
//! letting the WAL grow without bound.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::storage::{ObjectStorage, ReliableStorage};
use crate::types::CancelToken;

struct Shared {
    conn: Mutex<Connection>,
    pending: Mutex<usize>,
    drained: Condvar,
    stop: Mutex<bool>,
    woken: Condvar,
}

/// The write-ahead log. Cloning shares the same underlying database and
/// drain thread.
pub struct LocalWal {
    shared: Arc<Shared>,
    drain_thread: Option<JoinHandle<()>>,
    high_water_mark: usize,
}

impl LocalWal {
    pub fn open<O: ObjectStorage + 'static>(db_path: &str, high_water_mark: usize, store: Arc<O>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| Error::Wal(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS wal_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                commit_seq INTEGER NOT NULL,
                key TEXT NOT NULL,
                value BLOB
            );
            CREATE INDEX IF NOT EXISTS wal_commit_seq ON wal_entries(commit_seq);",
        )
        .map_err(|e| Error::Wal(e.to_string()))?;

        let pending = count_pending_commits(&conn)?;

        let shared = Arc::new(Shared {
            conn: Mutex::new(conn),
            pending: Mutex::new(pending),
            drained: Condvar::new(),
            stop: Mutex::new(false),
            woken: Condvar::new(),
        });

        let drain_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("blockvault-wal-drain".into())
                .spawn(move || drain_loop(shared, store))
                .map_err(|e| Error::Wal(e.to_string()))?
        };

        Ok(Self {
            shared,
            drain_thread: Some(drain_thread),
            high_water_mark,
        })
    }

    /// Blocks the caller until a currently-running drain thread has applied
    /// every commit appended before this call. Used by tests and by callers
    /// that need read-your-writes visibility against the object store
    /// directly.
    pub fn flush(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.shared.drained.wait(pending).unwrap();
        }
    }
}

impl Drop for LocalWal {
    fn drop(&mut self) {
        *self.shared.stop.lock().unwrap() = true;
        self.shared.woken.notify_all();
        if let Some(handle) = self.drain_thread.take() {
            let _ = handle.join();
        }
    }
}

impl ReliableStorage for LocalWal {
    fn start(&mut self, prefetch: &[String], cancel: &CancelToken) -> Result<HashMap<String, Vec<u8>>> {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            while *pending >= self.high_water_mark {
                if cancel.is_cancelled() {
                    return Err(Error::BackPressure);
                }
                let (guard, timeout) = self
                    .shared
                    .drained
                    .wait_timeout(pending, Duration::from_millis(50))
                    .unwrap();
                pending = guard;
                if timeout.timed_out() && cancel.is_cancelled() {
                    return Err(Error::BackPressure);
                }
            }
        }

        let mut out = HashMap::with_capacity(prefetch.len());
        for key in prefetch {
            if let Some(bytes) = self.get(key).ok() {
                out.insert(key.clone(), bytes);
            }
        }
        Ok(out)
    }

    fn get(&mut self, key: &str) -> Result<Vec<u8>> {
        let conn = self.shared.conn.lock().unwrap();
        let newest: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT value FROM wal_entries WHERE key = ?1 ORDER BY commit_seq DESC, id DESC LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Wal(e.to_string()))?;
        match newest {
            Some(Some(bytes)) => Ok(bytes),
            Some(None) => Err(Error::NotFound(key.to_string())),
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    fn commit(&mut self, writes: Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut conn = self.shared.conn.lock().unwrap();
        let txn = conn.transaction().map_err(|e| Error::Wal(e.to_string()))?;
        let commit_seq: i64 = txn
            .query_row(
                "SELECT COALESCE(MAX(commit_seq), 0) + 1 FROM wal_entries",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Wal(e.to_string()))?;
        for (key, value) in &writes {
            txn.execute(
                "INSERT INTO wal_entries (commit_seq, key, value) VALUES (?1, ?2, ?3)",
                params![commit_seq, key, value],
            )
            .map_err(|e| Error::Wal(e.to_string()))?;
        }
        txn.commit().map_err(|e| Error::Wal(e.to_string()))?;
        drop(conn);

        *self.shared.pending.lock().unwrap() += 1;
        self.shared.woken.notify_all();
        debug!(commit_seq, writes = writes.len(), "WAL commit appended");
        Ok(())
    }

    fn rollback(&mut self) {
        // Nothing was staged outside of `commit`, which is atomic; a
        // transaction that never called `commit` has nothing to undo.
    }
}

fn count_pending_commits(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT commit_seq) FROM wal_entries",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Wal(e.to_string()))?;
    Ok(count as usize)
}

fn drain_loop<O: ObjectStorage>(shared: Arc<Shared>, store: Arc<O>) {
    info!("WAL drain thread started");
    loop {
        if *shared.stop.lock().unwrap() {
            break;
        }
        match drain_one(&shared, &*store) {
            Ok(true) => continue,
            Ok(false) => {
                let stop = shared.stop.lock().unwrap();
                if *stop {
                    break;
                }
                let _ = shared
                    .woken
                    .wait_timeout(stop, Duration::from_millis(100))
                    .unwrap();
            }
            Err(e) => {
                error!(error = %e, "WAL drain failed, retrying");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    info!("WAL drain thread stopped");
}

/// Drains the oldest undrained commit, applying its writes to `store`.
/// Returns `Ok(true)` if a commit was drained, `Ok(false)` if there was
/// nothing to do.
fn drain_one<O: ObjectStorage>(shared: &Shared, store: &O) -> Result<bool> {
    let rows: Vec<(i64, i64, String, Option<Vec<u8>>)> = {
        let conn = shared.conn.lock().unwrap();
        let oldest: Option<i64> = conn
            .query_row(
                "SELECT MIN(commit_seq) FROM wal_entries",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Wal(e.to_string()))?
            .flatten();
        let Some(oldest) = oldest else {
            return Ok(false);
        };
        let mut stmt = conn
            .prepare("SELECT id, commit_seq, key, value FROM wal_entries WHERE commit_seq = ?1")
            .map_err(|e| Error::Wal(e.to_string()))?;
        let rows = stmt
            .query_map(params![oldest], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(|e| Error::Wal(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Wal(e.to_string()))?;
        rows
    };

    if rows.is_empty() {
        return Ok(false);
    }

    let commit_seq = rows[0].1;
    for (_, _, key, value) in &rows {
        match value {
            Some(bytes) => store.set(key, bytes)?,
            None => store.delete(key)?,
        }
    }

    let conn = shared.conn.lock().unwrap();
    conn.execute(
        "DELETE FROM wal_entries WHERE commit_seq = ?1",
        params![commit_seq],
    )
    .map_err(|e| Error::Wal(e.to_string()))?;
    drop(conn);

    let mut pending = shared.pending.lock().unwrap();
    *pending = pending.saturating_sub(1);
    shared.drained.notify_all();
    warn_if_nonzero(*pending);
    Ok(true)
}

fn warn_if_nonzero(pending: usize) {
    if pending > 0 {
        debug!(pending, "WAL drain thread still catching up");
    }
}
