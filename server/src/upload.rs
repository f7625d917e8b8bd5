//! Avatar file storage.
//!
//! Uploaded avatars are written to the configured directory under a random
//! file name and served back at `/uploads/<name>`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::body::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// URL prefix the upload directory is served under.
pub const UPLOADS_PREFIX: &str = "/uploads";

/// Largest accepted registration body, avatar included (5 MiB).
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// An avatar file received with a registration.
#[derive(Clone)]
pub struct AvatarUpload {
    pub content_type: String,
    pub bytes: Bytes,
}

impl std::fmt::Debug for AvatarUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarUpload")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// File extension for an accepted image content type.
pub fn avatar_extension(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Writes avatars to disk.
#[derive(Debug, Clone)]
pub struct AvatarStore {
    dir: PathBuf,
}

impl AvatarStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves an avatar and returns the URL it is served at.
    pub async fn save(&self, upload: &AvatarUpload) -> Result<String> {
        let extension = avatar_extension(&upload.content_type)
            .with_context(|| format!("Unsupported avatar type {}", upload.content_type))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create upload directory {}", self.dir.display()))?;

        let file_name = format!("{}.{}", Uuid::new_v4(), extension);
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, &upload.bytes)
            .await
            .with_context(|| format!("Failed to write avatar {}", path.display()))?;

        info!(file = %file_name, size = upload.bytes.len(), "Stored avatar");
        Ok(format!("{UPLOADS_PREFIX}/{file_name}"))
    }

    /// Deletes a previously saved avatar, given its URL. Failures are logged
    /// and otherwise ignored.
    pub async fn remove(&self, url: &str) {
        let Some(file_name) = url
            .strip_prefix(UPLOADS_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains(|c| c == '/' || c == '\\') && !name.contains(".."))
        else {
            debug!(url, "Ignoring removal of non-upload URL");
            return;
        };

        if let Err(e) = tokio::fs::remove_file(self.dir.join(file_name)).await {
            warn!(file = file_name, error = %e, "Failed to remove avatar");
        }
    }
}
