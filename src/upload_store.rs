//! Raw upload archival.
//!
//! Every accepted payload is written verbatim to the upload directory
//! before processing, as an audit/backup copy of what the sensor actually
//! sent. Archival failures are logged and counted but never block batch
//! processing - the in-memory tracking result matters more than the
//! backup copy.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

// ---

/// Writes each accepted payload under a receipt-timestamped filename.
/// Cheap to clone; handlers share one instance.
#[derive(Debug, Clone)]
pub struct UploadStore {
    // ---
    dir: PathBuf,
    faults: Arc<AtomicU64>,
}

impl UploadStore {
    // ---
    /// Ensure the upload directory exists.
    pub async fn init(dir: &str) -> Result<Self> {
        // ---
        let dir = PathBuf::from(dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create upload directory '{}'", dir.display()))?;
        Ok(UploadStore {
            dir,
            faults: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Archive one payload. Returns the path written, or `None` on failure
    /// (logged and counted; the caller keeps processing).
    ///
    /// Filenames carry the receipt timestamp plus a random suffix so two
    /// uploads landing in the same second cannot clobber each other.
    pub async fn archive(&self, received_at: DateTime<Utc>, payload: &[u8]) -> Option<PathBuf> {
        // ---
        let filename = format!(
            "upload_{}_{}.csv",
            received_at.format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8],
        );
        let path = self.dir.join(filename);

        match tokio::fs::write(&path, payload).await {
            Ok(()) => {
                debug!("Archived {} bytes to {}", payload.len(), path.display());
                Some(path)
            }
            Err(e) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                error!("Failed to archive upload to '{}': {}", path.display(), e);
                None
            }
        }
    }

    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn scratch_dir(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("bletrace-{tag}-{}", Uuid::new_v4().simple()))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn archives_payload_verbatim() {
        // ---
        let store = UploadStore::init(&scratch_dir("uploads")).await.unwrap();
        let received_at = Utc::now();

        let path = store.archive(received_at, b"timestamp,device_address\n").await;

        let path = path.expect("archive should succeed");
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"timestamp,device_address\n");
        assert_eq!(store.fault_count(), 0);

        tokio::fs::remove_dir_all(store.dir()).await.unwrap();
    }

    #[tokio::test]
    async fn same_second_uploads_get_distinct_files() {
        // ---
        let store = UploadStore::init(&scratch_dir("uploads")).await.unwrap();
        let received_at = Utc::now();

        let a = store.archive(received_at, b"a").await.unwrap();
        let b = store.archive(received_at, b"b").await.unwrap();
        assert_ne!(a, b);

        tokio::fs::remove_dir_all(store.dir()).await.unwrap();
    }
}
