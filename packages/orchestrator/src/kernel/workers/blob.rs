//! Blob storage seam: write-once HTML bodies addressed by (task, attempt).
//!
//! A second `put` to the same address returns the existing reference rather
//! than overwriting, which makes redelivered downloads idempotent. The real
//! sink behind this trait is deployment-specific; the filesystem
//! implementation covers single-node setups and development.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::common::OrchestratorError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a body under the (task, attempt) address and return its
    /// reference. Idempotent per address.
    async fn put(
        &self,
        task_id: Uuid,
        attempt: i32,
        body: &[u8],
    ) -> Result<String, OrchestratorError>;

    /// Read a body back. A missing blob is `HtmlNotAvailable`.
    async fn get(&self, blob_ref: &str) -> Result<Bytes, OrchestratorError>;
}

// ============================================================================
// Filesystem implementation
// ============================================================================

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, task_id: Uuid, attempt: i32) -> PathBuf {
        self.root.join(task_id.to_string()).join(format!("{attempt}.html"))
    }

    fn relative_ref(task_id: Uuid, attempt: i32) -> String {
        format!("{task_id}/{attempt}.html")
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        task_id: Uuid,
        attempt: i32,
        body: &[u8],
    ) -> Result<String, OrchestratorError> {
        let path = self.path_for(task_id, attempt);
        let parent = path.parent().expect("blob path has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob mkdir: {e}")))?;

        // create_new is the conditional put: the first writer wins, a
        // concurrent or repeated write observes AlreadyExists.
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(body)
                    .await
                    .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob write: {e}")))?;
                file.flush()
                    .await
                    .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob flush: {e}")))?;
                Ok(Self::relative_ref(task_id, attempt))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(Self::relative_ref(task_id, attempt))
            }
            Err(e) => Err(OrchestratorError::StoreUnavailable(format!(
                "blob open: {e}"
            ))),
        }
    }

    async fn get(&self, blob_ref: &str) -> Result<Bytes, OrchestratorError> {
        let path = self.root.join(blob_ref);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                OrchestratorError::HtmlNotAvailable(format!("blob {blob_ref} is gone")),
            ),
            Err(e) => Err(OrchestratorError::StoreUnavailable(format!(
                "blob read: {e}"
            ))),
        }
    }
}

// ============================================================================
// In-memory implementation for tests
// ============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: std::sync::Mutex<std::collections::HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, blob_ref: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(blob_ref)
    }

    pub fn remove(&self, blob_ref: &str) {
        self.blobs.lock().unwrap().remove(blob_ref);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        task_id: Uuid,
        attempt: i32,
        body: &[u8],
    ) -> Result<String, OrchestratorError> {
        let blob_ref = format!("{task_id}/{attempt}.html");
        self.blobs
            .lock()
            .unwrap()
            .entry(blob_ref.clone())
            .or_insert_with(|| Bytes::from(body.to_vec()));
        Ok(blob_ref)
    }

    async fn get(&self, blob_ref: &str) -> Result<Bytes, OrchestratorError> {
        self.blobs
            .lock()
            .unwrap()
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| OrchestratorError::HtmlNotAvailable(format!("blob {blob_ref} is gone")))
    }
}
