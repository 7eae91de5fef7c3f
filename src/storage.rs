//! Storage capability shared by input discovery and output writing.
//!
//! Paths are plain strings so the same calls address local files and S3
//! object keys. Implementations must be safe to share across tasks.
//!
//! | Backend | Type | Selected by |
//! |---------|------|-------------|
//! | local filesystem | [`LocalStorage`](crate::storage_fs::LocalStorage) | `storage_type: local` |
//! | S3 / S3-compatible | [`S3Storage`](crate::storage_s3::S3Storage) | `storage_type: s3` |

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use crate::config::Config;
use crate::storage_fs::LocalStorage;
use crate::storage_s3::S3Storage;

/// Result of [`Storage::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Final path component.
    pub name: String,
    pub size: u64,
    /// Unix permission bits; synthesised where the backend has none.
    pub mode: u32,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logs.
    fn kind(&self) -> &'static str;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace `path`, creating parent directories as needed.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Every file under `prefix` (recursively), sorted. A file prefix lists
    /// itself.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn is_directory(&self, path: &str) -> Result<bool>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Streaming reader over the contents of `path`.
    async fn get_reader(&self, path: &str) -> Result<BoxedReader>;
}

/// Build the backend named by `config.storage_type`.
pub fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.storage_type.as_str() {
        "local" => Ok(Arc::new(LocalStorage::new())),
        "s3" => Ok(Arc::new(S3Storage::new(&config.s3)?)),
        other => bail!("Unknown storage type: '{}'. Must be local or s3.", other),
    }
}

/// Final component of a `/`-separated path.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

/// Everything before the final component, or `""`.
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}
