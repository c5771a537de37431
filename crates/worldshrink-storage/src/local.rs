use crate::traits::{FileEntry, RestoreSummary, StorageError, StorageResult, WorldStorage};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::TempPath;
use tokio::fs;
use walkdir::WalkDir;
use worldshrink_core::EngineConfig;

/// Prefix of temporary files created next to their destination
pub const STAGING_PREFIX: &str = ".worldshrink-";

/// Local filesystem storage for one world
#[derive(Clone, Debug)]
pub struct LocalWorldStorage {
    reference_root: PathBuf,
    world_root: PathBuf,
    trash_dir_name: String,
    trash_root: PathBuf,
}

impl LocalWorldStorage {
    /// Create a storage handle
    ///
    /// # Arguments
    /// * `reference_root` - Directory keys are relative to (e.g. Foundry's `Data`)
    /// * `world_root` - The world directory, inside `reference_root`
    /// * `trash_dir_name` - Name of the trash directory created inside the world
    pub fn new(
        reference_root: impl Into<PathBuf>,
        world_root: impl Into<PathBuf>,
        trash_dir_name: &str,
    ) -> StorageResult<Self> {
        let reference_root = reference_root.into();
        let world_root = world_root.into();

        if world_root.strip_prefix(&reference_root).is_err() {
            return Err(StorageError::InvalidKey(format!(
                "World root {} is not inside reference root {}",
                world_root.display(),
                reference_root.display()
            )));
        }

        let trash_root = world_root.join(trash_dir_name);
        Ok(LocalWorldStorage {
            reference_root,
            world_root,
            trash_dir_name: trash_dir_name.to_string(),
            trash_root,
        })
    }

    pub fn from_config(config: &EngineConfig) -> StorageResult<Self> {
        Self::new(
            &config.reference_root,
            &config.world_root,
            &config.trash_dir_name,
        )
    }

    pub fn trash_root(&self) -> &Path {
        &self.trash_root
    }

    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.reference_root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }

    fn trash_path_for(&self, path: &Path) -> StorageResult<PathBuf> {
        let relative = path.strip_prefix(&self.world_root).map_err(|_| {
            StorageError::InvalidKey(format!("{} is outside the world", path.display()))
        })?;
        if relative.starts_with(&self.trash_dir_name) {
            return Err(StorageError::InvalidKey(format!(
                "{} is already in the trash",
                path.display()
            )));
        }
        Ok(self.trash_root.join(relative))
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn staging_dir(path: &Path) -> StorageResult<&Path> {
        path.parent()
            .ok_or_else(|| StorageError::InvalidKey(format!("{} has no parent", path.display())))
    }
}

fn is_staging_file(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with(STAGING_PREFIX)
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::IoError(std::io::Error::other(e))
}

#[async_trait]
impl WorldStorage for LocalWorldStorage {
    fn reference_root(&self) -> &Path {
        &self.reference_root
    }

    fn world_root(&self) -> &Path {
        &self.world_root
    }

    /// Convert a key to a filesystem path with traversal validation
    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(StorageError::InvalidKey(format!(
                "Storage key contains invalid characters: {}",
                key
            )));
        }

        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StorageError::InvalidKey(format!(
                "Storage key resolves outside storage directory: {}",
                key
            )));
        }

        Ok(self.reference_root.join(relative))
    }

    async fn list_world(&self) -> StorageResult<Vec<FileEntry>> {
        let this = self.clone();
        let start = std::time::Instant::now();

        let entries = tokio::task::spawn_blocking(move || -> StorageResult<Vec<FileEntry>> {
            let mut entries = Vec::new();
            let walker = WalkDir::new(&this.world_root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    let is_trash = e.depth() == 1
                        && e.file_type().is_dir()
                        && e.file_name() == this.trash_dir_name.as_str();
                    !is_trash && !is_staging_file(e.file_name())
                });

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) if err.depth() == 0 => return Err(std::io::Error::from(err).into()),
                    Err(err) => {
                        tracing::warn!(error = %err, "Skipping unreadable entry while listing world");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(key) = this.path_to_key(entry.path()) else {
                    continue;
                };
                let size = match entry.metadata() {
                    Ok(meta) => meta.len(),
                    Err(err) => {
                        tracing::warn!(path = %entry.path().display(), error = %err, "Skipping file without metadata");
                        continue;
                    }
                };
                entries.push(FileEntry {
                    key,
                    absolute: entry.path().to_path_buf(),
                    size,
                });
            }

            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(entries)
        })
        .await
        .map_err(join_error)??;

        tracing::info!(
            world = %self.world_root.display(),
            files = entries.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "World listing complete"
        );

        Ok(entries)
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(key)?;

        fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::IoError(e),
        })
    }

    async fn write_atomic(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        let dir = Self::staging_dir(&path)?.to_path_buf();
        let size = data.len();
        let start = std::time::Instant::now();

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let mut staged = tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(&dir)
                .map_err(|e| {
                    StorageError::WriteFailed(format!(
                        "Failed to create temporary file in {}: {}",
                        dir.display(),
                        e
                    ))
                })?;

            staged.write_all(&data).map_err(|e| {
                StorageError::WriteFailed(format!("Failed to write {}: {}", target.display(), e))
            })?;
            staged.as_file().sync_all().map_err(|e| {
                StorageError::WriteFailed(format!("Failed to sync {}: {}", target.display(), e))
            })?;

            if let Ok(meta) = std::fs::metadata(&target) {
                staged.as_file().set_permissions(meta.permissions())?;
            }

            staged.persist(&target).map_err(|e| {
                StorageError::WriteFailed(format!(
                    "Failed to replace {}: {}",
                    target.display(),
                    e.error
                ))
            })?;
            Ok(())
        })
        .await
        .map_err(join_error)??;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Atomic write successful"
        );

        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn stage(&self, key: &str, suffix: &str) -> StorageResult<TempPath> {
        let path = self.key_to_path(key)?;
        self.ensure_parent_dir(&path).await?;
        let dir = Self::staging_dir(&path)?;

        let staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(suffix)
            .tempfile_in(dir)?;
        Ok(staged.into_temp_path())
    }

    async fn commit(&self, staged: TempPath, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        staged.persist(&path).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to move output to {}: {}", path.display(), e.error))
        })?;

        tracing::debug!(path = %path.display(), key = %key, "Staged file committed");
        Ok(())
    }

    async fn move_to_trash(&self, key: &str) -> StorageResult<PathBuf> {
        let path = self.key_to_path(key)?;
        let destination = self.trash_path_for(&path)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.ensure_parent_dir(&destination).await?;
        fs::rename(&path, &destination).await?;

        tracing::debug!(
            key = %key,
            trash_path = %destination.display(),
            "Moved file to trash"
        );

        Ok(destination)
    }

    async fn purge_trash(&self) -> StorageResult<usize> {
        if !fs::try_exists(&self.trash_root).await.unwrap_or(false) {
            return Ok(0);
        }

        let trash_root = self.trash_root.clone();
        let count = tokio::task::spawn_blocking(move || {
            WalkDir::new(&trash_root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count()
        })
        .await
        .map_err(join_error)?;

        fs::remove_dir_all(&self.trash_root).await?;

        tracing::info!(
            trash = %self.trash_root.display(),
            files = count,
            "Trash purged"
        );

        Ok(count)
    }

    async fn restore_trash(&self) -> StorageResult<RestoreSummary> {
        if !fs::try_exists(&self.trash_root).await.unwrap_or(false) {
            return Ok(RestoreSummary::default());
        }

        let trash_root = self.trash_root.clone();
        let world_root = self.world_root.clone();

        let summary = tokio::task::spawn_blocking(move || -> StorageResult<RestoreSummary> {
            let mut summary = RestoreSummary::default();

            for entry in WalkDir::new(&trash_root) {
                let entry = entry.map_err(std::io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&trash_root) else {
                    continue;
                };
                let destination = world_root.join(relative);

                if destination.exists() {
                    tracing::warn!(
                        path = %destination.display(),
                        "Original location is occupied, leaving file in trash"
                    );
                    summary.skipped += 1;
                    continue;
                }

                if let Some(parent) = destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(entry.path(), &destination)?;
                summary.restored += 1;
            }

            // Drop directories emptied by the restore, deepest first.
            for entry in WalkDir::new(&trash_root).contents_first(true).into_iter().flatten() {
                if entry.file_type().is_dir() {
                    let _ = std::fs::remove_dir(entry.path());
                }
            }

            Ok(summary)
        })
        .await
        .map_err(join_error)??;

        tracing::info!(
            trash = %self.trash_root.display(),
            restored = summary.restored,
            skipped = summary.skipped,
            "Trash restore complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn world_layout() -> (tempfile::TempDir, LocalWorldStorage) {
        let dir = tempdir().unwrap();
        let world = dir.path().join("worlds").join("w");
        std::fs::create_dir_all(world.join("scenes")).unwrap();
        let storage = LocalWorldStorage::new(dir.path(), &world, "_trash").unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, storage) = world_layout();

        let result = storage.read("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.write_atomic("worlds/../../etc/passwd", Vec::new()).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_list_world_skips_trash_and_staging_files() {
        let (_dir, storage) = world_layout();
        let world = storage.world_root().to_path_buf();
        std::fs::write(world.join("scenes/a.png"), b"a").unwrap();
        std::fs::write(world.join("scenes/.worldshrink-abc.webp"), b"tmp").unwrap();
        std::fs::create_dir_all(world.join("_trash/scenes")).unwrap();
        std::fs::write(world.join("_trash/scenes/old.png"), b"old").unwrap();

        let entries = storage.list_world().await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["worlds/w/scenes/a.png"]);
        assert_eq!(entries[0].size, 1);
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let (_dir, storage) = world_layout();
        let key = "worlds/w/scenes/doc.json";
        std::fs::write(storage.key_to_path(key).unwrap(), b"{\"old\":1}").unwrap();

        storage
            .write_atomic(key, b"{\"new\":2}".to_vec())
            .await
            .unwrap();

        assert_eq!(storage.read(key).await.unwrap(), b"{\"new\":2}".to_vec());
        let leftovers = std::fs::read_dir(storage.world_root().join("scenes"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| is_staging_file(&e.file_name()))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_stage_and_commit() {
        let (_dir, storage) = world_layout();
        let key = "worlds/w/scenes/out.webp";

        let staged = storage.stage(key, ".webp").await.unwrap();
        std::fs::write(&staged, b"RIFF").unwrap();
        assert!(!storage.exists(key).await.unwrap());

        storage.commit(staged, key).await.unwrap();
        assert_eq!(storage.read(key).await.unwrap(), b"RIFF".to_vec());
    }

    #[tokio::test]
    async fn test_dropped_stage_leaves_nothing_behind() {
        let (_dir, storage) = world_layout();
        let staged = storage.stage("worlds/w/scenes/out.webp", ".webp").await.unwrap();
        let path = staged.to_path_buf();
        assert!(path.exists());
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_trash_then_restore() {
        let (_dir, storage) = world_layout();
        let key = "worlds/w/scenes/b.png";
        std::fs::write(storage.key_to_path(key).unwrap(), b"b").unwrap();

        let trashed = storage.move_to_trash(key).await.unwrap();
        assert!(trashed.ends_with("_trash/scenes/b.png"));
        assert!(!storage.exists(key).await.unwrap());

        let summary = storage.restore_trash().await.unwrap();
        assert_eq!(summary, RestoreSummary { restored: 1, skipped: 0 });
        assert!(storage.exists(key).await.unwrap());
        assert!(!storage.trash_root().exists());
    }

    #[tokio::test]
    async fn test_restore_keeps_conflicting_files_in_trash() {
        let (_dir, storage) = world_layout();
        let key = "worlds/w/scenes/b.png";
        let path = storage.key_to_path(key).unwrap();
        std::fs::write(&path, b"old").unwrap();
        storage.move_to_trash(key).await.unwrap();
        std::fs::write(&path, b"new").unwrap();

        let summary = storage.restore_trash().await.unwrap();
        assert_eq!(summary, RestoreSummary { restored: 0, skipped: 1 });
        assert_eq!(std::fs::read(&path).unwrap(), b"new".to_vec());
        assert!(storage.trash_root().join("scenes/b.png").exists());
    }

    #[tokio::test]
    async fn test_purge_trash_counts_files() {
        let (_dir, storage) = world_layout();
        for name in ["a.png", "b.png"] {
            let key = format!("worlds/w/scenes/{}", name);
            std::fs::write(storage.key_to_path(&key).unwrap(), b"x").unwrap();
            storage.move_to_trash(&key).await.unwrap();
        }

        assert_eq!(storage.purge_trash().await.unwrap(), 2);
        assert!(!storage.trash_root().exists());
        assert_eq!(storage.purge_trash().await.unwrap(), 0);
    }
}
