use super::{ContentFingerprint, ImageFormat, MediaPath};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeStatus {
    #[default]
    Pending,
    Done,
    Failed,
    Skipped,
}

/// One media file observed on disk during the initial walk.
#[derive(Debug, Clone, Serialize)]
pub struct AssetRecord {
    pub path: MediaPath,
    /// Path relative to the reference root as it appears on disk (original case, `/` separators)
    pub relative: String,
    #[serde(skip)]
    pub absolute: PathBuf,
    pub size: u64,
    pub fingerprint: Option<ContentFingerprint>,
    /// Format sniffed from the file's leading bytes
    pub format: Option<ImageFormat>,
    pub status: TranscodeStatus,
}

impl AssetRecord {
    pub fn new(path: MediaPath, relative: String, absolute: PathBuf, size: u64) -> Self {
        Self {
            path,
            relative,
            absolute,
            size,
            fingerprint: None,
            format: None,
            status: TranscodeStatus::Pending,
        }
    }

    pub fn is_format(&self, format: ImageFormat) -> bool {
        self.format == Some(format)
    }
}
