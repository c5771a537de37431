//! Configuration module
//!
//! Engine settings with typed defaults, overridable through `WORLDSHRINK_*` environment
//! variables (a `.env` file is honoured). Command-line flags are layered on top by the CLI.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::models::{QualityPreset, TargetCodec};

const DEFAULT_MEDIA_EXTENSIONS: &str = "png,jpg,jpeg,webp";
const DEFAULT_EXCLUDED_DOCUMENTS: &str = "data/settings.db";
const DEFAULT_TRASH_DIR: &str = "_trash";
const DEFAULT_CODEC_PROGRAM: &str = "ffmpeg";
const FALLBACK_MAX_WORKERS: usize = 4;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub world_root: PathBuf,
    /// Directory document paths are written relative to
    pub reference_root: PathBuf,
    /// Read-only installation data; references into it are external
    pub core_data_root: Option<PathBuf>,
    /// Lowercase extensions (no dot) treated as media
    pub media_extensions: Vec<String>,
    pub target_codec: TargetCodec,
    pub quality: QualityPreset,
    pub codec_program: String,
    pub max_workers: usize,
    pub delete_unreferenced: bool,
    pub purge_trash: bool,
    pub trash_dir_name: String,
    pub repair_module_paths: bool,
    /// World-relative document paths that are never scanned or rewritten
    pub excluded_documents: Vec<String>,
}

impl EngineConfig {
    /// Defaults for a world, without consulting the environment.
    pub fn for_world(world_root: impl Into<PathBuf>) -> Self {
        let world_root = world_root.into();
        let reference_root = default_reference_root(&world_root);
        Self {
            world_root,
            reference_root,
            core_data_root: None,
            media_extensions: split_list(DEFAULT_MEDIA_EXTENSIONS),
            target_codec: TargetCodec::default(),
            quality: QualityPreset::default(),
            codec_program: DEFAULT_CODEC_PROGRAM.to_string(),
            max_workers: default_max_workers(),
            delete_unreferenced: false,
            purge_trash: true,
            trash_dir_name: DEFAULT_TRASH_DIR.to_string(),
            repair_module_paths: true,
            excluded_documents: split_list(DEFAULT_EXCLUDED_DOCUMENTS),
        }
    }

    /// Load from the environment. `WORLDSHRINK_WORLD_ROOT` must be set.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let world_root = env::var("WORLDSHRINK_WORLD_ROOT")
            .map_err(|_| anyhow::anyhow!("WORLDSHRINK_WORLD_ROOT must be set"))?;
        Self::from_lookup(PathBuf::from(world_root), |key| env::var(key).ok())
    }

    /// Load from the environment for an explicitly given world root.
    pub fn from_env_for(world_root: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(world_root.into(), |key| env::var(key).ok())
    }

    pub fn from_lookup<F>(world_root: PathBuf, lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::for_world(world_root);

        if let Some(root) = lookup("WORLDSHRINK_REFERENCE_ROOT") {
            config.reference_root = PathBuf::from(root);
        }
        config.core_data_root = lookup("WORLDSHRINK_CORE_DATA_ROOT").map(PathBuf::from);

        if let Some(exts) = lookup("WORLDSHRINK_MEDIA_EXTENSIONS") {
            config.media_extensions = split_list(&exts)
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect();
        }
        if let Some(codec) = lookup("WORLDSHRINK_TARGET_CODEC") {
            config.target_codec = TargetCodec::parse(&codec)?;
        }
        if let Some(quality) = lookup("WORLDSHRINK_QUALITY") {
            config.quality = QualityPreset::parse(&quality)?;
        }
        if let Some(program) = lookup("WORLDSHRINK_CODEC_PATH") {
            config.codec_program = program;
        }
        if let Some(workers) = lookup("WORLDSHRINK_MAX_WORKERS") {
            config.max_workers = workers
                .parse()
                .map_err(|_| anyhow::anyhow!("WORLDSHRINK_MAX_WORKERS must be a valid number"))?;
        }
        config.delete_unreferenced = lookup("WORLDSHRINK_DELETE_UNREFERENCED")
            .map(|v| parse_bool(&v))
            .unwrap_or(config.delete_unreferenced);
        config.purge_trash = lookup("WORLDSHRINK_PURGE_TRASH")
            .map(|v| parse_bool(&v))
            .unwrap_or(config.purge_trash);
        config.repair_module_paths = lookup("WORLDSHRINK_REPAIR_MODULE_PATHS")
            .map(|v| parse_bool(&v))
            .unwrap_or(config.repair_module_paths);
        if let Some(name) = lookup("WORLDSHRINK_TRASH_DIR") {
            config.trash_dir_name = name;
        }
        if let Some(excluded) = lookup("WORLDSHRINK_EXCLUDED_DOCUMENTS") {
            config.excluded_documents = split_list(&excluded);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.world_root.is_dir() {
            return Err(EngineError::WorldRootMissing(self.world_root.clone()));
        }

        if self.max_workers == 0 {
            return Err(EngineError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }

        if self.media_extensions.is_empty() {
            return Err(EngineError::InvalidConfig(
                "media extension allow-list cannot be empty".to_string(),
            ));
        }

        if !self.world_root.starts_with(&self.reference_root) {
            return Err(EngineError::InvalidConfig(format!(
                "reference root {} does not contain world root {}",
                self.reference_root.display(),
                self.world_root.display()
            )));
        }

        if self.trash_dir_name.is_empty()
            || self.trash_dir_name.contains(['/', '\\'])
            || self.trash_dir_name == ".."
        {
            return Err(EngineError::InvalidConfig(format!(
                "invalid trash directory name: {:?}",
                self.trash_dir_name
            )));
        }

        Ok(())
    }

    pub fn is_media_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.media_extensions.iter().any(|e| *e == ext)
    }

    /// World root expressed relative to the reference root, `/`-separated.
    pub fn world_prefix(&self) -> String {
        self.world_root
            .strip_prefix(&self.reference_root)
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }
}

/// Foundry keeps worlds at `<Data>/worlds/<world>` and documents reference media
/// relative to `<Data>`. Any other layout is treated as self-contained.
pub fn default_reference_root(world_root: &Path) -> PathBuf {
    let parent = world_root.parent();
    let parent_is_worlds = parent
        .and_then(|p| p.file_name())
        .map(|name| name.eq_ignore_ascii_case("worlds"))
        .unwrap_or(false);

    match (parent_is_worlds, parent.and_then(|p| p.parent())) {
        (true, Some(data)) => data.to_path_buf(),
        _ => world_root.to_path_buf(),
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_MAX_WORKERS)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reference_root_follows_foundry_layout() {
        let root = default_reference_root(Path::new("/srv/Data/worlds/my-world"));
        assert_eq!(root, PathBuf::from("/srv/Data"));

        let root = default_reference_root(Path::new("/srv/backups/my-world"));
        assert_eq!(root, PathBuf::from("/srv/backups/my-world"));
    }

    #[test]
    fn world_prefix_is_relative_to_reference_root() {
        let config = EngineConfig::for_world("/srv/Data/worlds/my-world");
        assert_eq!(config.world_prefix(), "worlds/my-world");

        let config = EngineConfig::for_world("/srv/standalone");
        assert_eq!(config.world_prefix(), "");
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("WORLDSHRINK_MEDIA_EXTENSIONS", "PNG, .jpg"),
            ("WORLDSHRINK_TARGET_CODEC", "avif"),
            ("WORLDSHRINK_QUALITY", "lighter"),
            ("WORLDSHRINK_MAX_WORKERS", "3"),
            ("WORLDSHRINK_DELETE_UNREFERENCED", "yes"),
            ("WORLDSHRINK_PURGE_TRASH", "false"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(PathBuf::from("/tmp/w"), |k| {
            vars.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.media_extensions, vec!["png", "jpg"]);
        assert_eq!(config.target_codec, TargetCodec::Avif);
        assert_eq!(config.quality, QualityPreset::Lighter);
        assert_eq!(config.max_workers, 3);
        assert!(config.delete_unreferenced);
        assert!(!config.purge_trash);
        assert!(config.repair_module_paths);
        assert_eq!(config.excluded_documents, vec!["data/settings.db"]);
    }

    #[test]
    fn lookup_rejects_bad_values() {
        let result = EngineConfig::from_lookup(PathBuf::from("/tmp/w"), |k| {
            (k == "WORLDSHRINK_MAX_WORKERS").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn validate_checks_world_root_and_limits() {
        let missing = EngineConfig::for_world("/definitely/not/here");
        assert!(matches!(
            missing.validate(),
            Err(EngineError::WorldRootMissing(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_world(dir.path());
        assert!(config.validate().is_ok());

        config.max_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        config.max_workers = 2;
        config.reference_root = PathBuf::from("/somewhere/else");
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn media_extension_check_is_case_insensitive() {
        let config = EngineConfig::for_world("/tmp/w");
        assert!(config.is_media_extension("PNG"));
        assert!(config.is_media_extension("jpeg"));
        assert!(!config.is_media_extension("gif"));
    }
}
