//! Persistent identity store backed by SQLite.
//!
//! Five tables, mirroring the data model:
//! - `identity` - cached identities keyed by signer pubkey
//! - `announce` - singleton cache of our own latest signed announcement
//! - `profile`  - singleton local profile
//! - `nodes`    - append-only set of claimed node pubkeys
//! - `config`   - singleton day-counter driving expiry
//!
//! ## Concurrency discipline
//!
//! A single connection guarded by a mutex is the only writer. Every
//! operation runs inside an immediate transaction through [`Store::with_txn`];
//! busy/locked errors at begin, body, or commit back off 250 ms (interruptible
//! by the store's lifetime token) and retry up to a bounded attempt count
//! before surfacing [`MeshError::Conflict`]. Constraint violations become
//! [`MeshError::AlreadyExists`] so callers can treat a lost insert race as
//! success.
//!
//! ## Day-counter expiry
//!
//! Identity records store an expiry day-count of `dayc + 30` at write time.
//! [`Store::trim`] advances `dayc` by exactly one tick per observed calendar
//! day change - never by the number of elapsed days - so a long offline
//! period costs the dataset at most one extra tick of survival instead of
//! mass-expiring everything at restart.

mod announce;
mod identities;
mod profiles;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{MeshError, MeshResult};

pub use announce::StoredAnnounce;
pub use identities::IdentityRecord;

/// Identity records expire this many day-counter ticks after their last write.
pub const EXPIRY_DAYS: i64 = 30;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const BUSY_RETRY_LIMIT: u32 = 120;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    dayc INTEGER NOT NULL,
    last INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS announce (
    payload BLOB NOT NULL,
    sig BLOB NOT NULL,
    time INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS identity (
    pubkey BLOB PRIMARY KEY NOT NULL,
    payload BLOB NOT NULL,
    sig BLOB NOT NULL,
    time INTEGER NOT NULL,
    dayc INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS profile (
    name TEXT NOT NULL,
    bio TEXT NOT NULL,
    lat INTEGER NOT NULL,
    long INTEGER NOT NULL,
    country TEXT NOT NULL,
    city TEXT NOT NULL,
    icon BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS nodes (
    pubkey BLOB PRIMARY KEY NOT NULL,
    time INTEGER NOT NULL
);
";

/// Transactional store for identities, the local profile, the cached
/// self-announcement, claimed node keys, and the expiry day-counter.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    cancel: CancellationToken,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Creates parent directories, applies the schema, and seeds the
    /// day-counter. Failure here is fatal to the process by design - there
    /// is no sensible way to run without a working store.
    pub fn open(path: impl AsRef<Path>, cancel: CancellationToken) -> MeshResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| db_err(e, "open database"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| db_err(e, "set journal mode"))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| db_err(e, "create schema"))?;
        init_config(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cancel,
        })
    }

    /// Expiry sweep: advance the day counter and delete expired identities.
    ///
    /// Returns whether the counter advanced. The counter moves by exactly
    /// one tick per observed calendar-day change regardless of how many
    /// days actually elapsed.
    pub async fn trim(&self) -> MeshResult<bool> {
        self.with_txn("trim", |tx| {
            let (dayc, last): (i64, i64) = tx
                .query_row("SELECT dayc,last FROM config LIMIT 1", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(|e| db_err(e, "trim: read config"))?;
            let today = unix_day_stamp();
            if last == today {
                return Ok(false);
            }
            let dayc = dayc + 1;
            tx.execute(
                "UPDATE config SET dayc=?1, last=?2",
                rusqlite::params![dayc, today],
            )
            .map_err(|e| db_err(e, "trim: update config"))?;
            tx.execute(
                "DELETE FROM identity WHERE dayc < ?1",
                rusqlite::params![dayc],
            )
            .map_err(|e| db_err(e, "trim: delete expired"))?;
            Ok(true)
        })
        .await
    }

    /// Run `body` inside an immediate transaction with busy-retry.
    ///
    /// The connection lock is held only for the duration of one attempt;
    /// backoff sleeps happen outside it and race against the lifetime token.
    /// Cancellation surfaces the pending conflict immediately rather than
    /// burning the remaining attempts.
    pub(crate) async fn with_txn<T>(
        &self,
        name: &'static str,
        mut body: impl FnMut(&Transaction<'_>) -> MeshResult<T>,
    ) -> MeshResult<T> {
        let mut attempts = BUSY_RETRY_LIMIT;
        loop {
            let result = {
                let mut conn = self.conn.lock();
                run_txn(&mut conn, name, &mut body)
            };
            match result {
                Err(MeshError::Conflict(_)) if attempts > 1 => {
                    attempts -= 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            warn!(op = name, "store operation cancelled during busy backoff");
                            return Err(MeshError::Conflict(name));
                        }
                        _ = tokio::time::sleep(BUSY_RETRY_DELAY) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

fn run_txn<T>(
    conn: &mut Connection,
    name: &'static str,
    body: &mut impl FnMut(&Transaction<'_>) -> MeshResult<T>,
) -> MeshResult<T> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_err(e, name))?;
    let value = body(&tx)?;
    tx.commit().map_err(|e| db_err(e, name))?;
    Ok(value)
}

fn init_config(conn: &Connection) -> MeshResult<()> {
    use rusqlite::OptionalExtension;
    let existing: Option<i64> = conn
        .query_row("SELECT dayc FROM config LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| db_err(e, "init config"))?;
    if existing.is_none() {
        conn.execute(
            "INSERT INTO config (dayc,last) VALUES (1,?1)",
            rusqlite::params![unix_day_stamp()],
        )
        .map_err(|e| db_err(e, "init config"))?;
    }
    Ok(())
}

/// Whole days since the unix epoch.
fn unix_day_stamp() -> i64 {
    chrono::Utc::now().timestamp() / SECONDS_PER_DAY
}

/// True for SQLite constraint violations (e.g. a duplicate primary key).
pub(crate) fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _)
        if e.code == rusqlite::ErrorCode::ConstraintViolation)
}

/// Map a rusqlite error into the store's taxonomy.
///
/// Constraint violations MUST become `AlreadyExists` to fulfil the API
/// contract; busy/locked becomes the retryable `Conflict`.
pub(crate) fn db_err(err: rusqlite::Error, what: &'static str) -> MeshError {
    if let rusqlite::Error::QueryReturnedNoRows = err {
        return MeshError::NotFound;
    }
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        match e.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return MeshError::Conflict(what);
            }
            rusqlite::ErrorCode::ConstraintViolation => {
                return MeshError::AlreadyExists;
            }
            _ => {}
        }
    }
    MeshError::Database(what, err)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use tempfile::TempDir;

    pub fn open_test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), CancellationToken::new()).unwrap();
        (store, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::open_test_store;
    use super::*;

    fn read_config(store: &Store) -> (i64, i64) {
        store
            .conn
            .lock()
            .query_row("SELECT dayc,last FROM config LIMIT 1", [], |row| {
                Ok((row.get(0).unwrap(), row.get(1).unwrap()))
            })
            .unwrap()
    }

    fn backdate_last_day(store: &Store, days: i64) {
        store
            .conn
            .lock()
            .execute("UPDATE config SET last = last - ?1", rusqlite::params![days])
            .unwrap();
    }

    #[test]
    fn test_store_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/path/test.db");
        let store = Store::open(&path, CancellationToken::new());
        assert!(store.is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_day_counter_seeded_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = Store::open(&path, CancellationToken::new()).unwrap();
            assert_eq!(read_config(&store).0, 1);
        }
        // reopening must not reset the counter
        let store = Store::open(&path, CancellationToken::new()).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE config SET dayc = 7", [])
            .unwrap();
        drop(store);
        let store = Store::open(&path, CancellationToken::new()).unwrap();
        assert_eq!(read_config(&store).0, 7);
    }

    #[tokio::test]
    async fn test_trim_same_day_is_noop() {
        let (store, _dir) = open_test_store();
        let advanced = store.trim().await.unwrap();
        assert!(!advanced);
        assert_eq!(read_config(&store).0, 1);
    }

    #[tokio::test]
    async fn test_trim_advances_one_tick_after_long_outage() {
        let (store, _dir) = open_test_store();
        store
            .set_identity(&[1u8; 32], b"payload", &[0u8; 64], 100)
            .await
            .unwrap();

        // simulate ten calendar days passing while the process was down
        backdate_last_day(&store, 10);
        let advanced = store.trim().await.unwrap();
        assert!(advanced);

        // one tick, not ten
        let (dayc, _) = read_config(&store);
        assert_eq!(dayc, 2);

        // record was written with expiry tick 31, far above 2
        assert!(store.get_identity(&[1u8; 32]).await.is_ok());

        // same stamp now - a second sweep does nothing
        assert!(!store.trim().await.unwrap());
    }

    #[tokio::test]
    async fn test_trim_deletes_expired_records() {
        let (store, _dir) = open_test_store();
        store
            .set_identity(&[1u8; 32], b"old", &[0u8; 64], 100)
            .await
            .unwrap();
        store
            .set_identity(&[2u8; 32], b"fresh", &[0u8; 64], 100)
            .await
            .unwrap();

        // force the first record's expiry tick below the next counter value
        store
            .conn
            .lock()
            .execute(
                "UPDATE identity SET dayc = 1 WHERE pubkey = ?1",
                rusqlite::params![[1u8; 32].as_slice()],
            )
            .unwrap();
        backdate_last_day(&store, 1);

        assert!(store.trim().await.unwrap());
        assert!(store.get_identity(&[1u8; 32]).await.unwrap_err().is_not_found());
        assert!(store.get_identity(&[2u8; 32]).await.is_ok());
    }
}
