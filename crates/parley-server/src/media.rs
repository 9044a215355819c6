//! Media storage boundary and the filesystem implementation.
//!
//! Objects are written under a fresh key per upload. The database never
//! shares a transaction with this store, so the send pipeline compensates
//! with [`MediaStorage::delete`] when a later step fails.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::MessageKind;

use crate::error::ServerError;

/// Handle to one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub key: String,
    /// Public URL written into the message content.
    pub url: String,
}

#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn put(
        &self,
        kind: MessageKind,
        data: &[u8],
        content_type: &str,
    ) -> Result<StoredMedia, ServerError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServerError>;

    async fn delete(&self, key: &str) -> Result<(), ServerError>;
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::Validation("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::Validation("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Media kept as plain files under one directory.
#[derive(Debug, Clone)]
pub struct FsMediaStorage {
    base_path: PathBuf,
    public_url: String,
}

impl FsMediaStorage {
    pub async fn new(base_path: PathBuf, public_url: impl Into<String>) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::MediaStorage(format!(
                "Failed to create media directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Media store initialized");

        Ok(Self {
            base_path,
            public_url: public_url.into(),
        })
    }

    /// Keys are `<uuid>.<ext>`; anything else is rejected before touching
    /// the filesystem.
    fn safe_path(&self, key: &str) -> Result<PathBuf, ServerError> {
        let valid = !key.is_empty()
            && key.len() <= 64
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !key.contains("..");
        if !valid {
            return Err(ServerError::Validation("Invalid media key".to_string()));
        }
        ensure_within(&self.base_path, &self.base_path.join(key))
    }
}

/// File extension for an uploaded MIME type.
fn extension_for(kind: MessageKind, content_type: &str) -> &'static str {
    match content_type.to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/aac" => "aac",
        "application/pdf" => "pdf",
        _ => match kind {
            MessageKind::Image => "img",
            MessageKind::Video => "vid",
            MessageKind::Audio => "aud",
            _ => "bin",
        },
    }
}

#[async_trait]
impl MediaStorage for FsMediaStorage {
    async fn put(
        &self,
        kind: MessageKind,
        data: &[u8],
        content_type: &str,
    ) -> Result<StoredMedia, ServerError> {
        if data.is_empty() {
            return Err(ServerError::Validation("Empty media file".to_string()));
        }

        let key = format!("{}.{}", Uuid::new_v4(), extension_for(kind, content_type));
        let path = self.safe_path(&key)?;

        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::MediaStorage(format!("Failed to write {key}: {e}")))?;

        debug!(key = %key, size = data.len(), kind = %kind, "Stored media");
        Ok(StoredMedia {
            url: format!("{}/{}", self.public_url, key),
            key,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound("Media not found".to_string()))
            }
            Err(e) => Err(ServerError::MediaStorage(format!("Failed to read {key}: {e}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ServerError> {
        let path = self.safe_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Deleted media");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound("Media not found".to_string()))
            }
            Err(e) => Err(ServerError::MediaStorage(format!("Failed to delete {key}: {e}"))),
        }
    }
}

/// Content type to serve a stored key with.
pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next().unwrap_or_default() {
        "png" => "image/png",
        "jpg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
