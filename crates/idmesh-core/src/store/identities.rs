//! Identity cache - freshness-gated upsert, lookup, and random choice.

use rusqlite::OptionalExtension;

use super::{db_err, is_constraint, Store, EXPIRY_DAYS};
use crate::error::{MeshError, MeshResult};

/// A cached identity as stored: payload bytes, detached signature, and the
/// signing time the freshness gate compares on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Signer's public key
    pub pubkey: [u8; 32],
    /// Encoded identity payload
    pub payload: Vec<u8>,
    /// 64-byte detached signature over the payload
    pub sig: Vec<u8>,
    /// Unix seconds the payload was signed
    pub time: i64,
}

impl Store {
    /// Insert or update an identity, but only if `time` is strictly newer
    /// than what is stored.
    ///
    /// Two writers racing on an unseen key are resolved by the primary-key
    /// constraint: the loser's insert reports `AlreadyExists`, which is a
    /// no-op here, not an error.
    pub async fn set_identity(
        &self,
        pubkey: &[u8; 32],
        payload: &[u8],
        sig: &[u8],
        time: i64,
    ) -> MeshResult<()> {
        let pubkey = pubkey.to_vec();
        let payload = payload.to_vec();
        let sig = sig.to_vec();
        self.with_txn("set_identity", move |tx| {
            let updated = tx
                .execute(
                    "UPDATE identity SET payload=?1, sig=?2, time=?3, \
                     dayc=?4+(SELECT dayc FROM config LIMIT 1) \
                     WHERE pubkey=?5 AND time<?3",
                    rusqlite::params![payload, sig, time, EXPIRY_DAYS, pubkey],
                )
                .map_err(|e| db_err(e, "set_identity: update"))?;
            if updated == 0 {
                let inserted = tx.execute(
                    "INSERT INTO identity (pubkey,payload,sig,time,dayc) \
                     VALUES (?1,?2,?3,?4,?5+(SELECT dayc FROM config LIMIT 1))",
                    rusqlite::params![pubkey, payload, sig, time, EXPIRY_DAYS],
                );
                match inserted {
                    Ok(_) => {}
                    // key exists with an equal-or-newer time: lost the race
                    Err(e) if is_constraint(&e) => {}
                    Err(e) => return Err(db_err(e, "set_identity: insert")),
                }
            }
            Ok(())
        })
        .await
    }

    /// Fetch a stored identity by signer public key.
    pub async fn get_identity(&self, pubkey: &[u8; 32]) -> MeshResult<IdentityRecord> {
        let key = pubkey.to_vec();
        let pubkey = *pubkey;
        self.with_txn("get_identity", move |tx| {
            let row = tx
                .query_row(
                    "SELECT payload,sig,time FROM identity WHERE pubkey=?1 LIMIT 1",
                    rusqlite::params![key],
                    |row| {
                        Ok(IdentityRecord {
                            pubkey,
                            payload: row.get(0)?,
                            sig: row.get(1)?,
                            time: row.get(2)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| db_err(e, "get_identity"))?;
            row.ok_or(MeshError::NotFound)
        })
        .await
    }

    /// Pick one stored identity uniformly at random, for gossip.
    pub async fn choose_identity(&self) -> MeshResult<IdentityRecord> {
        self.with_txn("choose_identity", |tx| {
            let row = tx
                .query_row(
                    "SELECT pubkey,payload,sig,time FROM identity WHERE rowid IN \
                     (SELECT rowid FROM identity ORDER BY RANDOM() LIMIT 1)",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| db_err(e, "choose_identity"))?;
            let (pubkey, payload, sig, time) = row.ok_or(MeshError::NotFound)?;
            let pubkey: [u8; 32] = pubkey
                .try_into()
                .map_err(|_| MeshError::Corrupt("identity pubkey length"))?;
            Ok(IdentityRecord {
                pubkey,
                payload,
                sig,
                time,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_test_store;
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_set_and_get_identity() {
        let (store, _dir) = open_test_store();
        store
            .set_identity(&[1u8; 32], b"payload", &[7u8; 64], 1000)
            .await
            .unwrap();

        let record = store.get_identity(&[1u8; 32]).await.unwrap();
        assert_eq!(record.payload, b"payload");
        assert_eq!(record.sig, vec![7u8; 64]);
        assert_eq!(record.time, 1000);
    }

    #[tokio::test]
    async fn test_get_missing_identity_is_not_found() {
        let (store, _dir) = open_test_store();
        let err = store.get_identity(&[9u8; 32]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_newer_write_wins() {
        let (store, _dir) = open_test_store();
        store
            .set_identity(&[1u8; 32], b"old", &[0u8; 64], 1000)
            .await
            .unwrap();
        store
            .set_identity(&[1u8; 32], b"new", &[1u8; 64], 2000)
            .await
            .unwrap();

        let record = store.get_identity(&[1u8; 32]).await.unwrap();
        assert_eq!(record.payload, b"new");
        assert_eq!(record.time, 2000);
    }

    #[tokio::test]
    async fn test_stale_write_is_noop() {
        let (store, _dir) = open_test_store();
        store
            .set_identity(&[1u8; 32], b"new", &[1u8; 64], 2000)
            .await
            .unwrap();
        // older and equal times must both lose
        store
            .set_identity(&[1u8; 32], b"stale", &[0u8; 64], 1000)
            .await
            .unwrap();
        store
            .set_identity(&[1u8; 32], b"same", &[0u8; 64], 2000)
            .await
            .unwrap();

        let record = store.get_identity(&[1u8; 32]).await.unwrap();
        assert_eq!(record.payload, b"new");
        assert_eq!(record.time, 2000);
    }

    #[tokio::test]
    async fn test_freshness_invariant_over_sequences() {
        // the stored record always corresponds to the maximum time ever written
        let (store, _dir) = open_test_store();
        let times = [50i64, 10, 90, 90, 20, 85];
        for t in times {
            let payload = format!("payload-{}", t);
            store
                .set_identity(&[3u8; 32], payload.as_bytes(), &[0u8; 64], t)
                .await
                .unwrap();
        }
        let record = store.get_identity(&[3u8; 32]).await.unwrap();
        assert_eq!(record.time, 90);
        assert_eq!(record.payload, b"payload-90");
    }

    #[test]
    fn test_freshness_invariant_proptest() {
        use proptest::prelude::*;

        proptest!(ProptestConfig::with_cases(32), |(times in prop::collection::vec(0i64..1000, 1..20))| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let record = rt.block_on(async {
                let (store, _dir) = open_test_store();
                for &t in &times {
                    let payload = t.to_le_bytes().to_vec();
                    store
                        .set_identity(&[1u8; 32], &payload, &[0u8; 64], t)
                        .await
                        .unwrap();
                }
                store.get_identity(&[1u8; 32]).await.unwrap()
            });
            let max = *times.iter().max().unwrap();
            prop_assert_eq!(record.time, max);
            prop_assert_eq!(record.payload, max.to_le_bytes().to_vec());
        });
    }

    #[tokio::test]
    async fn test_choose_identity_empty_is_not_found() {
        let (store, _dir) = open_test_store();
        assert!(store.choose_identity().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_choose_identity_is_roughly_uniform() {
        let (store, _dir) = open_test_store();
        const KEYS: u8 = 5;
        const DRAWS: usize = 500;
        for i in 0..KEYS {
            store
                .set_identity(&[i; 32], &[i], &[0u8; 64], 1000 + i as i64)
                .await
                .unwrap();
        }

        let mut counts: HashMap<[u8; 32], usize> = HashMap::new();
        for _ in 0..DRAWS {
            let record = store.choose_identity().await.unwrap();
            *counts.entry(record.pubkey).or_default() += 1;
        }

        assert_eq!(counts.len(), KEYS as usize);
        for (key, count) in counts {
            // expectation is 100 per key; allow a generous band
            assert!(
                count > 40 && count < 200,
                "key {:?} drawn {} times",
                key[0],
                count
            );
        }
    }
}
