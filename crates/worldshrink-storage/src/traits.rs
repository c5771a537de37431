//! Storage abstraction trait
//!
//! The engine touches the filesystem only through [`WorldStorage`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use worldshrink_core::EngineError;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Destination already exists: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StorageError {
    /// Attach the path the failed operation was about.
    pub fn into_engine(self, path: impl Into<PathBuf>) -> EngineError {
        match self {
            StorageError::IoError(source) => EngineError::io(path, source),
            other => EngineError::io(path, std::io::Error::other(other.to_string())),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A regular file found while listing the world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Key relative to the reference root, original case
    pub key: String,
    pub absolute: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    /// Entries left in the trash because the original location is occupied again
    pub skipped: usize,
}

/// Filesystem operations for one world
#[async_trait]
pub trait WorldStorage: Send + Sync {
    /// Directory keys are relative to
    fn reference_root(&self) -> &Path;

    fn world_root(&self) -> &Path;

    /// Validate a key and resolve it to a filesystem path
    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf>;

    /// Every regular file under the world root, trash and staging files excluded
    async fn list_world(&self) -> StorageResult<Vec<FileEntry>>;

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Replace the file at `key` with `data` through a temporary file and rename
    async fn write_atomic(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Reserve a temporary path next to `key` for an external writer
    async fn stage(&self, key: &str, suffix: &str) -> StorageResult<TempPath>;

    /// Move a staged file into place at `key`
    async fn commit(&self, staged: TempPath, key: &str) -> StorageResult<()>;

    /// Move a world file into the trash, keeping its world-relative layout
    async fn move_to_trash(&self, key: &str) -> StorageResult<PathBuf>;

    /// Permanently delete the trash directory. Returns the number of files removed.
    async fn purge_trash(&self) -> StorageResult<usize>;

    /// Move every trashed file back to where it came from
    async fn restore_trash(&self) -> StorageResult<RestoreSummary>;
}
