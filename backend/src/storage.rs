use std::path::{Path, PathBuf};

use crate::error::AppError;

pub const ORIGINALS_PREFIX: &str = "originals";
pub const THUMBNAILS_PREFIX: &str = "thumbnails";

#[derive(Clone)]
pub struct LocalStorage {
    upload_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(upload_dir: &str) -> Self {
        Self {
            upload_dir: PathBuf::from(upload_dir),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), AppError> {
        let path = self.upload_dir.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create directory: {e}")))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write file: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, AppError> {
        let path = self.upload_dir.join(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to read file {key}: {e}")))
    }

    pub async fn delete(&self, key: &str) {
        let path = self.upload_dir.join(key);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!("Failed to delete {key}: {e}");
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("/api/files/{key}")
    }
}

#[derive(Clone)]
pub enum StorageBackend {
    Local(LocalStorage),
}

impl StorageBackend {
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), AppError> {
        match self {
            Self::Local(s) => s.put(key, data).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, AppError> {
        match self {
            Self::Local(s) => s.get(key).await,
        }
    }

    pub async fn delete(&self, key: &str) {
        match self {
            Self::Local(s) => s.delete(key).await,
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        match self {
            Self::Local(s) => s.public_url(key),
        }
    }

    pub fn local_upload_dir(&self) -> Option<&Path> {
        match self {
            Self::Local(s) => Some(s.upload_dir()),
        }
    }
}

/// Blobs written on behalf of one unit of work. Call `discard` when the
/// database side fails so nothing is left behind, `keep` once it committed.
pub struct StagedBlobs<'a> {
    storage: &'a StorageBackend,
    keys: Vec<String>,
}

impl<'a> StagedBlobs<'a> {
    pub fn new(storage: &'a StorageBackend) -> Self {
        Self {
            storage,
            keys: Vec::new(),
        }
    }

    pub async fn put(&mut self, key: String, data: &[u8]) -> Result<(), AppError> {
        self.storage.put(&key, data).await?;
        self.keys.push(key);
        Ok(())
    }

    pub fn keep(self) {}

    pub async fn discard(self) {
        tracing::debug!(count = self.keys.len(), "discarding staged blobs");
        for key in &self.keys {
            self.storage.delete(key).await;
        }
    }
}

/// Storage key for an original upload.
pub fn original_key(stored_filename: &str) -> String {
    format!("{ORIGINALS_PREFIX}/{stored_filename}")
}

/// Storage key for the thumbnail derived from a stored filename.
pub fn thumbnail_key(stored_filename: &str) -> String {
    let stem = Path::new(stored_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(stored_filename);
    format!("{THUMBNAILS_PREFIX}/{stem}.webp")
}
