//! Durable storage for received files
//!
//! Transport file handles are only valid while the transfer is live, so
//! completed files are moved into a directory the session owns. Every
//! transfer gets its own destination name.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::transport::PayloadId;

/// A received file at its final location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ReceivedFileStore {
    dir: PathBuf,
}

impl ReceivedFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Destination for one transfer, unique per (endpoint, payload)
    pub fn destination(&self, endpoint_id: &str, payload_id: PayloadId) -> PathBuf {
        let endpoint: String = endpoint_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("received-{}-{}", endpoint, payload_id))
    }

    /// Move a completed transport file into the store
    pub async fn persist(
        &self,
        endpoint_id: &str,
        payload_id: PayloadId,
        transient: &Path,
    ) -> io::Result<ReceivedFile> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let destination = self.destination(endpoint_id, payload_id);

        if tokio::fs::rename(transient, &destination).await.is_err() {
            // Rename fails across filesystems; fall back to copy
            tokio::fs::copy(transient, &destination).await?;
            if let Err(e) = tokio::fs::remove_file(transient).await {
                debug!("Could not remove transport file {}: {}", transient.display(), e);
            }
        }

        let size = tokio::fs::metadata(&destination).await?.len();
        debug!("Stored received file at {} ({} bytes)", destination.display(), size);
        Ok(ReceivedFile {
            path: destination,
            size,
        })
    }

    /// Throw away partial data from a failed transfer
    pub async fn discard(&self, transient: &Path) {
        match tokio::fs::remove_file(transient).await {
            Ok(()) => debug!("Discarded partial file {}", transient.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard partial file {}: {}", transient.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_destination_is_unique_and_sanitized() {
        let store = ReceivedFileStore::new("/cache");
        let a = store.destination("peer/../A", 7);
        let b = store.destination("peer/../A", 8);
        assert_ne!(a, b);
        assert_eq!(a, PathBuf::from("/cache/received-peer____A-7"));
    }

    #[tokio::test]
    async fn test_persist_moves_file() {
        let tmp = TempDir::new("tandem-store").unwrap();
        let transient = tmp.path().join("incoming.part");
        tokio::fs::write(&transient, b"RIFF....WAVE").await.unwrap();

        let store = ReceivedFileStore::new(tmp.path().join("store"));
        let received = store.persist("host", 1, &transient).await.unwrap();

        assert_eq!(received.size, 12);
        assert!(received.path.starts_with(store.dir()));
        assert!(!transient.exists());
        assert_eq!(tokio::fs::read(&received.path).await.unwrap(), b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn test_discard_missing_file_is_quiet() {
        let tmp = TempDir::new("tandem-store").unwrap();
        let store = ReceivedFileStore::new(tmp.path());
        store.discard(&tmp.path().join("never-existed")).await;
    }
}
