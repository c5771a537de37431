use std::path::Path;
use worldshrink_core::{QualityPreset, TargetCodec};

/// Encoder settings for the target codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeSettings {
    pub codec: TargetCodec,
    pub quality: QualityPreset,
}

impl EncodeSettings {
    pub fn new(codec: TargetCodec, quality: QualityPreset) -> Self {
        Self { codec, quality }
    }

    /// ffmpeg arguments that encode `input` as a single still image at `output`.
    pub fn ffmpeg_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
        ];

        match self.codec {
            TargetCodec::WebP => {
                args.extend_from_slice(&[
                    "-c:v".to_string(),
                    "libwebp".to_string(),
                    "-quality".to_string(),
                    self.quality.webp_quality().to_string(),
                    "-frames:v".to_string(),
                    "1".to_string(),
                    "-f".to_string(),
                    "webp".to_string(),
                ]);
            }
            TargetCodec::Avif => {
                args.extend_from_slice(&[
                    "-c:v".to_string(),
                    "libaom-av1".to_string(),
                    "-still-picture".to_string(),
                    "1".to_string(),
                    "-crf".to_string(),
                    self.quality.avif_crf().to_string(),
                    "-frames:v".to_string(),
                    "1".to_string(),
                    "-f".to_string(),
                    "avif".to_string(),
                ]);
            }
        }

        args.push(output.to_string_lossy().to_string());
        args
    }
}
