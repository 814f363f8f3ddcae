//! # Local Store
//!
//! One encrypted snapshot file, replaced atomically:
//!
//! ```text
//!   write snapshot.enc.tmp ─► fsync ─► rename over snapshot.enc
//! ```
//!
//! A crash at any point leaves either the previous good file or the new one,
//! never a torn mix. The synchronous [`LocalStore::write`] is what the
//! orchestrator calls under the chain lock.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{SnapshotTier, TierError, TierHandle, TierKind, TierResult};
use crate::config::LOCAL_SNAPSHOT_FILE;

#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    /// Store at `<data_dir>/snapshot.enc`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::at(data_dir.as_ref().join(LOCAL_SNAPSHOT_FILE))
    }

    /// Store at an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Another store in the same directory, named `file_name`.
    pub fn sibling(&self, file_name: &str) -> LocalStore {
        Self::at(self.path.with_file_name(file_name))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Atomically replace the snapshot file with `bytes`.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "local snapshot written");
        Ok(())
    }

    /// Read the snapshot file. A missing file is `Ok(None)`.
    pub fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete the snapshot file if present.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> TierResult<T>
    where
        T: Send + 'static,
        F: FnOnce(LocalStore) -> io::Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| TierError::Unavailable(format!("local I/O task failed: {e}")))?
            .map_err(TierError::from)
    }
}

#[async_trait]
impl SnapshotTier for LocalStore {
    fn kind(&self) -> TierKind {
        TierKind::Local
    }

    async fn put(&self, bytes: &[u8]) -> TierResult<TierHandle> {
        let bytes = bytes.to_vec();
        self.blocking(move |store| store.write(&bytes)).await?;
        Ok(TierHandle::Path(self.path.clone()))
    }

    async fn get(&self, handle: &TierHandle) -> TierResult<Option<Vec<u8>>> {
        match handle {
            TierHandle::MostRecent => self.blocking(|store| store.read()).await,
            TierHandle::Path(p) if p == &self.path => self.blocking(|store| store.read()).await,
            other => Err(TierError::UnsupportedHandle {
                tier: TierKind::Local,
                handle: other.clone(),
            }),
        }
    }

    async fn latest(&self) -> TierResult<Option<(TierHandle, Vec<u8>)>> {
        let bytes = self.blocking(|store| store.read()).await?;
        Ok(bytes.map(|b| (TierHandle::Path(self.path.clone()), b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalStore::in_dir(dir.path()).read().unwrap().is_none());
    }

    #[test]
    fn write_replaces_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path().join("nested"));
        store.write(b"first").unwrap();
        store.write(b"second").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"second");
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn stale_tmp_does_not_affect_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path());
        store.write(b"good").unwrap();
        fs::write(store.tmp_path(), b"half-writ").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"good");
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path());
        store.clear().unwrap();
        store.write(b"x").unwrap();
        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn tier_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path());
        assert!(store.latest().await.unwrap().is_none());

        let handle = store.put(b"sealed").await.unwrap();
        assert_eq!(handle, TierHandle::Path(store.path().to_path_buf()));
        assert_eq!(store.get(&handle).await.unwrap().unwrap(), b"sealed");
        assert_eq!(store.latest().await.unwrap().unwrap().1, b"sealed");
        assert!(matches!(
            store.get(&TierHandle::Record(1)).await,
            Err(TierError::UnsupportedHandle { .. })
        ));
    }
}
