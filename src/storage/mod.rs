//! Media attachments: conversion to a storable form and the uploads area.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;

/// An attachment as picked by the user, before it becomes part of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl MediaUpload {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self, StorageError> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        Ok(Self::new(file_name, mime.as_ref(), Bytes::from(bytes)))
    }

    /// Inline `data:` URI, the storable form on the local-only path.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// A media reference ready to be embedded in a post or comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub url: String,
    pub mime_type: String,
}

/// Durable, retrievable storage for attachments.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the upload and return a URL other devices can fetch.
    async fn put(&self, upload: &MediaUpload) -> Result<String, StorageError>;
}

/// Uploads directory served under `/uploads/` by `umuw serve`.
#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored name; `None` for anything that could escape the root.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name != sanitize_file_name(name) || name.starts_with('.') {
            return None;
        }
        Some(self.root.join(name))
    }

    /// Write bytes under a fresh unique name and return that name. An
    /// existing file is never replaced.
    pub async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let name = format!(
            "{}-{}",
            uuid::Uuid::now_v7().simple(),
            sanitize_file_name(file_name)
        );
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.root.join(&name))
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        tracing::info!("Stored upload {} ({} bytes)", name, bytes.len());
        Ok(name)
    }
}

#[async_trait]
impl BlobStore for UploadDir {
    async fn put(&self, upload: &MediaUpload) -> Result<String, StorageError> {
        let name = self.store(&upload.file_name, &upload.bytes).await?;
        Ok(format!("/uploads/{}", name))
    }
}

/// Keep ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
