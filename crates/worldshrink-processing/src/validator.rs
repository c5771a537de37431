use worldshrink_core::{EngineConfig, ImageFormat};

/// Validation errors for produced media files
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Output file is missing")]
    Missing,

    #[error("Empty file")]
    EmptyFile,

    #[error("Unexpected content: expected {expected:?}, found {found:?}")]
    UnexpectedFormat {
        expected: ImageFormat,
        found: Option<ImageFormat>,
    },
}

/// Detect an image container from its leading bytes.
pub fn sniff_format(head: &[u8]) -> Option<ImageFormat> {
    if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageFormat::Png);
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some(ImageFormat::Gif);
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some(ImageFormat::WebP);
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        let brand = &head[8..12];
        if brand == b"avif" || brand == b"avis" {
            return Some(ImageFormat::Avif);
        }
    }
    None
}

/// Check that a produced file is non-empty and holds the expected format.
pub fn validate_output(
    size: u64,
    head: &[u8],
    expected: ImageFormat,
) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(ValidationError::EmptyFile);
    }

    let found = sniff_format(head);
    if found != Some(expected) {
        return Err(ValidationError::UnexpectedFormat { expected, found });
    }

    Ok(())
}

/// Decides whether a document string is a media reference.
///
/// The check is purely lexical: it never touches the filesystem.
#[derive(Debug, Clone)]
pub struct MediaMatcher {
    allowed_extensions: Vec<String>,
}

impl MediaMatcher {
    pub fn new(allowed_extensions: Vec<String>) -> Self {
        Self {
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.media_extensions.clone())
    }

    /// Links to other hosts and inline data are never local files.
    pub fn is_external(raw: &str) -> bool {
        let lower = raw.trim_start().to_lowercase();
        lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.starts_with("data:")
            || lower.starts_with("//")
    }

    pub fn has_media_extension(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        let path = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
        let file = path.rsplit(['/', '\\']).next().unwrap_or(path);

        match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                let ext = ext.to_lowercase();
                self.allowed_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }

    /// A whole string value that names a local media file.
    pub fn is_candidate(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        !trimmed.is_empty()
            && !trimmed.contains(['\n', '<', '>', '"'])
            && !Self::is_external(trimmed)
            && self.has_media_extension(trimmed)
    }
}
