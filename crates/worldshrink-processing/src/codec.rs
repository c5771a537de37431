//! External codec invocation
//!
//! The engine treats encoding as opaque: a program reads `input` and writes `output`.
//! Any abnormal exit or missing output is a failure; stderr is kept for diagnostics only.

use crate::compression::EncodeSettings;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use worldshrink_core::{EngineError, QualityPreset, TargetCodec};

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";
const STDERR_EXCERPT_LEN: usize = 400;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Codec program {program} cannot be invoked: {reason}")]
    Unavailable { program: String, reason: String },

    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Codec produced no usable output: {0}")]
    InvalidOutput(String),
}

impl CodecError {
    /// Per-asset form for the run report
    pub fn for_asset(&self, path: &str) -> EngineError {
        EngineError::Codec {
            path: path.to_string(),
            message: self.to_string(),
        }
    }
}

/// Something that can encode one image file into the target codec
#[async_trait]
pub trait CodecInvoker: Send + Sync {
    /// Encode `input` into `output`. `output` may already exist as an empty file.
    async fn encode(&self, input: &Path, output: &Path) -> Result<(), CodecError>;

    fn target(&self) -> TargetCodec;

    /// Fail if the codec cannot be invoked at all
    async fn check_available(&self) -> Result<(), CodecError>;

    fn name(&self) -> &str;
}

/// Runs an external program built from an argument template.
///
/// `{input}` and `{output}` in the template are replaced with the file paths.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    program: String,
    args: Vec<String>,
    probe_args: Vec<String>,
    target: TargetCodec,
}

impl CommandCodec {
    pub fn new(program: impl Into<String>, args: Vec<String>, target: TargetCodec) -> Self {
        Self {
            program: program.into(),
            args,
            probe_args: Vec::new(),
            target,
        }
    }

    /// ffmpeg with the encoder and quality of `settings`
    pub fn ffmpeg(program: impl Into<String>, target: TargetCodec, quality: QualityPreset) -> Self {
        let settings = EncodeSettings::new(target, quality);
        let args = settings.ffmpeg_args(Path::new(INPUT_PLACEHOLDER), Path::new(OUTPUT_PLACEHOLDER));
        Self {
            program: program.into(),
            args,
            probe_args: vec!["-hide_banner".to_string(), "-version".to_string()],
            target,
        }
    }

    /// Arguments for an availability probe; the program must exit successfully with them.
    pub fn with_probe(mut self, probe_args: Vec<String>) -> Self {
        self.probe_args = probe_args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }

    fn resolve_program(&self) -> Option<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 || program.is_absolute() {
            return program.is_file().then(|| program.to_path_buf());
        }

        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

fn excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT_LEN {
        return text.to_string();
    }
    let mut end = STDERR_EXCERPT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[async_trait]
impl CodecInvoker for CommandCodec {
    #[tracing::instrument(skip(self), fields(codec = %self.program))]
    async fn encode(&self, input: &Path, output: &Path) -> Result<(), CodecError> {
        let args = self.render_args(input, output);
        let start = std::time::Instant::now();

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CodecError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(CodecError::Failed {
                status: result.status.to_string(),
                stderr: excerpt(&result.stderr),
            });
        }

        tracing::debug!(
            input = %input.display(),
            output = %output.display(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Codec finished"
        );

        Ok(())
    }

    fn target(&self) -> TargetCodec {
        self.target
    }

    async fn check_available(&self) -> Result<(), CodecError> {
        if self.probe_args.is_empty() {
            return match self.resolve_program() {
                Some(_) => Ok(()),
                None => Err(CodecError::Unavailable {
                    program: self.program.clone(),
                    reason: "not found".to_string(),
                }),
            };
        }

        let status = Command::new(&self.program)
            .args(&self.probe_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| CodecError::Unavailable {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(CodecError::Unavailable {
                program: self.program.clone(),
                reason: format!("probe exited with {}", status),
            });
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.program
    }
}
