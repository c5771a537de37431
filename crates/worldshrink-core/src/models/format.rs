use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image container detected from file content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Avif,
}

impl ImageFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::WebP),
            "avif" => Some(ImageFormat::Avif),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::WebP => "webp",
            ImageFormat::Avif => "avif",
        }
    }

    pub fn to_mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Avif => "image/avif",
        }
    }
}

/// Codec that canonical outputs are transcoded to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetCodec {
    #[default]
    WebP,
    Avif,
}

impl TargetCodec {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "webp" => Ok(TargetCodec::WebP),
            "avif" => Ok(TargetCodec::Avif),
            _ => Err(anyhow!("Invalid target codec: {}", s)),
        }
    }

    pub fn extension(self) -> &'static str {
        self.format().extension()
    }

    pub fn format(self) -> ImageFormat {
        match self {
            TargetCodec::WebP => ImageFormat::WebP,
            TargetCodec::Avif => ImageFormat::Avif,
        }
    }
}

impl fmt::Display for TargetCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Quality presets for image compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    #[default]
    Normal, // Balanced size and quality
    Better,   // Higher quality, larger files
    Best,     // Near pristine quality
    Lighter,  // Smaller files
    Lightest, // Maximum compression
}

impl QualityPreset {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(QualityPreset::Normal),
            "better" => Ok(QualityPreset::Better),
            "best" => Ok(QualityPreset::Best),
            "lighter" => Ok(QualityPreset::Lighter),
            "lightest" => Ok(QualityPreset::Lightest),
            _ => Err(anyhow!("Invalid quality preset: {}", s)),
        }
    }

    /// Get quality value for WebP (0-100)
    pub fn webp_quality(self) -> u8 {
        match self {
            QualityPreset::Normal => 80,
            QualityPreset::Better => 90,
            QualityPreset::Best => 98,
            QualityPreset::Lighter => 70,
            QualityPreset::Lightest => 55,
        }
    }

    /// Get constant rate factor for AV1 still images (0-63, lower is better)
    pub fn avif_crf(self) -> u8 {
        match self {
            QualityPreset::Normal => 32,
            QualityPreset::Better => 26,
            QualityPreset::Best => 18,
            QualityPreset::Lighter => 38,
            QualityPreset::Lightest => 45,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_map_to_formats() {
        assert_eq!(ImageFormat::from_extension("JPEG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("tiff"), None);
        assert_eq!(TargetCodec::Avif.extension(), "avif");
        assert_eq!(TargetCodec::default().format(), ImageFormat::WebP);
    }

    #[test]
    fn quality_presets_parse_case_insensitively() {
        assert_eq!(QualityPreset::parse("Best").unwrap(), QualityPreset::Best);
        assert!(QualityPreset::parse("ultra").is_err());
        assert!(QualityPreset::Best.webp_quality() > QualityPreset::Lightest.webp_quality());
        assert!(QualityPreset::Best.avif_crf() < QualityPreset::Lightest.avif_crf());
    }
}
