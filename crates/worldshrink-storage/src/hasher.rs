//! Streaming content fingerprints

use crate::traits::{StorageError, StorageResult};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;
use worldshrink_core::ContentFingerprint;

/// Leading bytes kept for format sniffing
pub const SNIFF_LEN: usize = 32;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub fingerprint: ContentFingerprint,
    pub size: u64,
    /// Up to [`SNIFF_LEN`] leading bytes
    pub head: Vec<u8>,
}

/// Hash a file in fixed-size chunks; memory use does not depend on file size.
pub async fn fingerprint(path: &Path) -> StorageResult<FileDigest> {
    let mut file = fs::File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        _ => StorageError::IoError(e),
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(read);
            head.extend_from_slice(&chunk[..take]);
        }
        hasher.update(chunk);
        size += read as u64;
    }

    Ok(FileDigest {
        fingerprint: ContentFingerprint::from_bytes(hasher.finalize().into()),
        size,
        head,
    })
}

pub fn fingerprint_bytes(data: &[u8]) -> ContentFingerprint {
    ContentFingerprint::from_bytes(Sha256::digest(data).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identical_bytes_share_a_fingerprint() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("nested-b.jpg");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let da = fingerprint(&a).await.unwrap();
        let db = fingerprint(&b).await.unwrap();
        assert_eq!(da.fingerprint, db.fingerprint);
        assert_eq!(da.fingerprint, fingerprint_bytes(b"same bytes"));
        assert_eq!(da.size, 10);
    }

    #[tokio::test]
    async fn repeated_hashing_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.png");
        let data: Vec<u8> = (0..(READ_BUFFER_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let first = fingerprint(&path).await.unwrap();
        let second = fingerprint(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint, fingerprint_bytes(&data));
        assert_eq!(first.size, data.len() as u64);
        assert_eq!(first.head, data[..SNIFF_LEN].to_vec());
    }

    #[tokio::test]
    async fn different_bytes_differ_and_short_files_keep_full_head() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        std::fs::write(&a, b"abc").unwrap();
        std::fs::write(&b, b"abd").unwrap();

        let da = fingerprint(&a).await.unwrap();
        let db = fingerprint(&b).await.unwrap();
        assert_ne!(da.fingerprint, db.fingerprint);
        assert_eq!(da.head, b"abc".to_vec());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result = fingerprint(&dir.path().join("nope.png")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
