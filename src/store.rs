use anyhow::Result;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use rand::Rng;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

use crate::tale::TaleDraft;

/// Leading bytes of a gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tale {id} not found")]
    NotFound { id: String },
    #[error("stored tale {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Compressed tale blobs, addressed by `(user_id, opaque id)`.
pub struct TaleStore {
    storage: Arc<dyn Storage>,
    root: String,
}

impl TaleStore {
    pub fn new(storage: Arc<dyn Storage>, root: &str) -> Self {
        Self { storage, root: root.trim_end_matches('/').to_string() }
    }

    fn blob_path(&self, user_id: &str, id: &str) -> String {
        format!("{}/{}/{}.json.gz", self.root, user_id, id)
    }

    pub async fn save(&self, user_id: &str, tale: &TaleDraft) -> Result<String, StoreError> {
        let id = new_tale_id();
        let json = serde_json::to_vec(tale).map_err(anyhow::Error::from)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(anyhow::Error::from)?;
        let compressed = encoder.finish().map_err(anyhow::Error::from)?;

        let path = self.blob_path(user_id, &id);
        self.storage.write(&path, &compressed).await?;
        info!("saved tale {} ({} pages, {} bytes compressed)", id, tale.pages.len(), compressed.len());
        Ok(id)
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Result<TaleDraft, StoreError> {
        let path = self.blob_path(user_id, id);
        if !self.storage.exists(&path).await? {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        let blob = self.storage.read(&path).await?;

        let json = if blob.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(blob.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("gzip decode failed: {}", e),
            })?;
            out
        } else {
            // Compression may have been skipped upstream; try the blob as-is
            // before declaring it corrupt.
            warn!("tale {} blob lacks gzip magic, trying as plain JSON", id);
            blob
        };

        serde_json::from_slice(&json).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("invalid tale JSON: {}", e),
        })
    }
}

fn new_tale_id() -> String {
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}
