//! Local profile singleton and the claimed node-key set.

use rusqlite::OptionalExtension;

use super::{db_err, Store};
use crate::error::{MeshError, MeshResult};
use crate::profile::Profile;

impl Store {
    /// Fetch the local profile.
    pub async fn get_profile(&self) -> MeshResult<Profile> {
        self.with_txn("get_profile", |tx| {
            let row = tx
                .query_row(
                    "SELECT name,bio,lat,long,country,city,icon FROM profile LIMIT 1",
                    [],
                    |row| {
                        Ok(Profile {
                            name: row.get(0)?,
                            bio: row.get(1)?,
                            lat: row.get(2)?,
                            long: row.get(3)?,
                            country: row.get(4)?,
                            city: row.get(5)?,
                            icon: row.get(6)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| db_err(e, "get_profile"))?;
            row.ok_or(MeshError::NotFound)
        })
        .await
    }

    /// Replace the local profile.
    pub async fn set_profile(&self, profile: &Profile) -> MeshResult<()> {
        let profile = profile.clone();
        self.with_txn("set_profile", move |tx| {
            let updated = tx
                .execute(
                    "UPDATE profile SET name=?1, bio=?2, lat=?3, long=?4, \
                     country=?5, city=?6, icon=?7",
                    rusqlite::params![
                        profile.name,
                        profile.bio,
                        profile.lat,
                        profile.long,
                        profile.country,
                        profile.city,
                        profile.icon
                    ],
                )
                .map_err(|e| db_err(e, "set_profile: update"))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO profile (name,bio,lat,long,country,city,icon) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        profile.name,
                        profile.bio,
                        profile.lat,
                        profile.long,
                        profile.country,
                        profile.city,
                        profile.icon
                    ],
                )
                .map_err(|e| db_err(e, "set_profile: insert"))?;
            }
            Ok(())
        })
        .await
    }

    /// All claimed node public keys.
    pub async fn get_profile_nodes(&self) -> MeshResult<Vec<[u8; 32]>> {
        self.with_txn("get_profile_nodes", |tx| {
            let mut stmt = tx
                .prepare("SELECT pubkey FROM nodes")
                .map_err(|e| db_err(e, "get_profile_nodes"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))
                .map_err(|e| db_err(e, "get_profile_nodes"))?;

            let mut nodes = Vec::new();
            for row in rows {
                let bytes = row.map_err(|e| db_err(e, "get_profile_nodes: scan"))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| MeshError::Corrupt("node pubkey length"))?;
                nodes.push(key);
            }
            Ok(nodes)
        })
        .await
    }

    /// Add a node key to the claim set, or refresh its last-seen time if it
    /// is already present.
    pub async fn add_profile_node(&self, pubkey: &[u8; 32]) -> MeshResult<()> {
        let pubkey = pubkey.to_vec();
        self.with_txn("add_profile_node", move |tx| {
            let now = chrono::Utc::now().timestamp();
            let updated = tx
                .execute(
                    "UPDATE nodes SET time=?1 WHERE pubkey=?2",
                    rusqlite::params![now, pubkey],
                )
                .map_err(|e| db_err(e, "add_profile_node: update"))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO nodes (pubkey,time) VALUES (?1,?2)",
                    rusqlite::params![pubkey, now],
                )
                .map_err(|e| db_err(e, "add_profile_node: insert"))?;
            }
            Ok(())
        })
        .await
    }
}
