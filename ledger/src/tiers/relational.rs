//! # Relational Backup Store
//!
//! Append-only backup rows with bounded retention, kept in sled.
//!
//! ## Tree Layout
//!
//! | Tree      | Key                   | Value                  |
//! |-----------|-----------------------|------------------------|
//! | `backups` | `id` (8B BE)          | `bincode(BackupRecord)`|
//!
//! Ids come from sled's monotonic id generator and are stored big-endian so
//! lexicographic order is numeric order: the last key is always the newest
//! backup, and pruning walks from the front.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info};

use super::{SnapshotTier, TierError, TierHandle, TierKind, TierResult};

/// One stored backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub encrypted_payload: Vec<u8>,
}

/// A record without its payload, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: usize,
}

impl From<&BackupRecord> for BackupSummary {
    fn from(r: &BackupRecord) -> Self {
        Self {
            id: r.id,
            name: r.name.clone(),
            created_at: r.created_at,
            size: r.encrypted_payload.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationalBackupStore {
    db: Db,
    backups: Tree,
    retention: usize,
}

impl RelationalBackupStore {
    /// Open or create the store at `path`. A retention of 0 is treated as 1.
    pub fn open<P: AsRef<Path>>(path: P, retention: usize) -> TierResult<Self> {
        Self::from_db(sled::open(path)?, retention)
    }

    /// In-memory store that disappears on drop.
    pub fn open_temporary(retention: usize) -> TierResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?, retention)
    }

    fn from_db(db: Db, retention: usize) -> TierResult<Self> {
        let backups = db.open_tree("backups")?;
        Ok(Self {
            db,
            backups,
            retention: retention.max(1),
        })
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Insert a new record, prune beyond retention, and flush.
    pub fn insert(&self, name: impl Into<String>, payload: &[u8]) -> TierResult<u64> {
        let record = BackupRecord {
            id: self.db.generate_id()?,
            name: name.into(),
            created_at: Utc::now(),
            encrypted_payload: payload.to_vec(),
        };
        let bytes =
            bincode::serialize(&record).map_err(|e| TierError::Serialization(e.to_string()))?;
        self.backups.insert(&record.id.to_be_bytes(), bytes)?;

        let pruned = self.prune()?;
        self.db.flush()?;
        debug!(id = record.id, pruned, "backup record inserted");
        Ok(record.id)
    }

    /// Remove the oldest records until at most `retention` remain.
    fn prune(&self) -> TierResult<usize> {
        let excess = self.backups.len().saturating_sub(self.retention);
        let doomed = self
            .backups
            .iter()
            .keys()
            .take(excess)
            .collect::<Result<Vec<_>, _>>()?;
        let mut pruned = 0;
        for key in doomed {
            self.backups.remove(key)?;
            pruned += 1;
        }
        if pruned > 0 {
            info!(pruned, retention = self.retention, "pruned old backup records");
        }
        Ok(pruned)
    }

    pub fn get_record(&self, id: u64) -> TierResult<Option<BackupRecord>> {
        self.backups
            .get(id.to_be_bytes())?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    pub fn most_recent(&self) -> TierResult<Option<BackupRecord>> {
        self.backups
            .last()?
            .map(|(_, bytes)| decode_record(&bytes))
            .transpose()
    }

    /// Summaries, newest first.
    pub fn list(&self) -> TierResult<Vec<BackupSummary>> {
        self.backups
            .iter()
            .values()
            .rev()
            .map(|bytes| Ok(BackupSummary::from(&decode_record(&bytes?)?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    /// Remove every record.
    pub fn clear(&self) -> TierResult<()> {
        self.backups.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

fn decode_record(bytes: &[u8]) -> TierResult<BackupRecord> {
    bincode::deserialize(bytes).map_err(|e| TierError::Serialization(e.to_string()))
}

fn auto_backup_name() -> String {
    format!("Auto-backup {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
}

#[async_trait]
impl SnapshotTier for RelationalBackupStore {
    fn kind(&self) -> TierKind {
        TierKind::Relational
    }

    async fn put(&self, bytes: &[u8]) -> TierResult<TierHandle> {
        let store = self.clone();
        let bytes = bytes.to_vec();
        let id = tokio::task::spawn_blocking(move || store.insert(auto_backup_name(), &bytes))
            .await
            .map_err(|e| TierError::Unavailable(format!("backup task failed: {e}")))??;
        Ok(TierHandle::Record(id))
    }

    async fn get(&self, handle: &TierHandle) -> TierResult<Option<Vec<u8>>> {
        let record = match handle {
            TierHandle::Record(id) => self.get_record(*id)?,
            TierHandle::MostRecent => self.most_recent()?,
            other => {
                return Err(TierError::UnsupportedHandle {
                    tier: TierKind::Relational,
                    handle: other.clone(),
                })
            }
        };
        Ok(record.map(|r| r.encrypted_payload))
    }

    async fn latest(&self) -> TierResult<Option<(TierHandle, Vec<u8>)>> {
        Ok(self
            .most_recent()?
            .map(|r| (TierHandle::Record(r.id), r.encrypted_payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch() {
        let store = RelationalBackupStore::open_temporary(10).unwrap();
        let id = store.insert("first", b"payload").unwrap();
        let record = store.get_record(id).unwrap().unwrap();
        assert_eq!(record.name, "first");
        assert_eq!(record.encrypted_payload, b"payload");
        assert!(store.get_record(id + 1000).unwrap().is_none());
    }

    #[test]
    fn most_recent_is_last_inserted() {
        let store = RelationalBackupStore::open_temporary(10).unwrap();
        assert!(store.most_recent().unwrap().is_none());
        store.insert("a", b"1").unwrap();
        let id = store.insert("b", b"2").unwrap();
        assert_eq!(store.most_recent().unwrap().unwrap().id, id);
    }

    #[test]
    fn inserts_never_overwrite() {
        let store = RelationalBackupStore::open_temporary(10).unwrap();
        let a = store.insert("same", b"1").unwrap();
        let b = store.insert("same", b"1").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn retention_prunes_oldest() {
        let store = RelationalBackupStore::open_temporary(3).unwrap();
        let ids: Vec<u64> = (0..5)
            .map(|i| store.insert(format!("b{i}"), &[i as u8]).unwrap())
            .collect();
        assert_eq!(store.len(), 3);
        assert!(store.get_record(ids[0]).unwrap().is_none());
        assert!(store.get_record(ids[1]).unwrap().is_none());
        let listed: Vec<u64> = store.list().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![ids[4], ids[3], ids[2]]);
    }

    #[test]
    fn zero_retention_keeps_one() {
        let store = RelationalBackupStore::open_temporary(0).unwrap();
        store.insert("a", b"1").unwrap();
        store.insert("b", b"2").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = RelationalBackupStore::open(dir.path().join("db"), 10).unwrap();
            store.insert("persisted", b"bytes").unwrap()
        };
        let store = RelationalBackupStore::open(dir.path().join("db"), 10).unwrap();
        assert_eq!(store.most_recent().unwrap().unwrap().id, id);
        let next = store.insert("after", b"more").unwrap();
        assert!(next > id);
    }

    #[tokio::test]
    async fn tier_contract() {
        let store = RelationalBackupStore::open_temporary(10).unwrap();
        let handle = store.put(b"sealed").await.unwrap();
        assert!(matches!(handle, TierHandle::Record(_)));
        assert_eq!(store.get(&handle).await.unwrap().unwrap(), b"sealed");
        assert_eq!(store.get(&TierHandle::MostRecent).await.unwrap().unwrap(), b"sealed");
        let (latest, _) = store.latest().await.unwrap().unwrap();
        assert_eq!(latest, handle);
        assert!(store.list().unwrap()[0].name.starts_with("Auto-backup "));
    }
}
