//! Self-announcement cache - singleton row holding the latest signed
//! announcement so an unchanged identity is not re-signed across restarts.

use rusqlite::OptionalExtension;

use super::{db_err, Store};
use crate::error::{MeshError, MeshResult};

/// The cached self-announcement: payload, signature, and absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnnounce {
    /// Encoded identity payload as signed
    pub payload: Vec<u8>,
    /// 64-byte detached signature
    pub sig: Vec<u8>,
    /// Unix seconds when the announcement stops being valid
    pub expires: i64,
}

impl Store {
    /// Fetch the cached self-announcement, if any.
    pub async fn get_announce(&self) -> MeshResult<StoredAnnounce> {
        self.with_txn("get_announce", |tx| {
            let row = tx
                .query_row("SELECT payload,sig,time FROM announce LIMIT 1", [], |row| {
                    Ok(StoredAnnounce {
                        payload: row.get(0)?,
                        sig: row.get(1)?,
                        expires: row.get(2)?,
                    })
                })
                .optional()
                .map_err(|e| db_err(e, "get_announce"))?;
            row.ok_or(MeshError::NotFound)
        })
        .await
    }

    /// Replace the cached self-announcement.
    pub async fn set_announce(&self, payload: &[u8], sig: &[u8], expires: i64) -> MeshResult<()> {
        let payload = payload.to_vec();
        let sig = sig.to_vec();
        self.with_txn("set_announce", move |tx| {
            let updated = tx
                .execute(
                    "UPDATE announce SET payload=?1, sig=?2, time=?3",
                    rusqlite::params![payload, sig, expires],
                )
                .map_err(|e| db_err(e, "set_announce: update"))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO announce (payload,sig,time) VALUES (?1,?2,?3)",
                    rusqlite::params![payload, sig, expires],
                )
                .map_err(|e| db_err(e, "set_announce: insert"))?;
            }
            Ok(())
        })
        .await
    }
}
