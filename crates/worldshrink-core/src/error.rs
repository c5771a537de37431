//! Error types module
//!
//! `EngineError` is the single taxonomy used across the pipeline. Per-item variants
//! (`Io`, `Codec`, `Parse`, `MissingAsset`, `Write`) are captured into the run report as
//! [`ItemFailure`] records; only the fatal variants abort a run.

use crate::models::{FailureKind, ItemFailure};
use std::path::PathBuf;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected conditions like references to deleted files
    Debug,
    /// Warning level - for per-item failures recorded in the report
    Warn,
    /// Error level - for conditions that abort the run
    Error,
}

/// Metadata describing how an error is surfaced
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "MISSING_ASSET")
    fn error_code(&self) -> &'static str;

    /// Whether this error aborts the whole run
    fn is_fatal(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec error for {path}: {message}")]
    Codec { path: String, message: String },

    #[error("Parse error in {document}: {message}")]
    Parse { document: String, message: String },

    #[error("Missing asset {raw_path} referenced by {document}")]
    MissingAsset { document: String, raw_path: String },

    #[error("Write error for {document}: {message}")]
    Write { document: String, message: String },

    #[error("World root does not exist: {}", .0.display())]
    WorldRootMissing(PathBuf),

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Convert a per-item error into a report entry. Fatal errors have no item form.
    pub fn to_failure(&self) -> Option<ItemFailure> {
        let failure = match self {
            EngineError::Io { path, source } => ItemFailure {
                kind: FailureKind::Io,
                path: Some(path.display().to_string()),
                document: None,
                message: source.to_string(),
            },
            EngineError::Codec { path, message } => ItemFailure {
                kind: FailureKind::Codec,
                path: Some(path.clone()),
                document: None,
                message: message.clone(),
            },
            EngineError::Parse { document, message } => ItemFailure {
                kind: FailureKind::Parse,
                path: None,
                document: Some(document.clone()),
                message: message.clone(),
            },
            EngineError::MissingAsset { document, raw_path } => ItemFailure {
                kind: FailureKind::MissingAsset,
                path: Some(raw_path.clone()),
                document: Some(document.clone()),
                message: "referenced file does not exist".to_string(),
            },
            EngineError::Write { document, message } => ItemFailure {
                kind: FailureKind::Write,
                path: None,
                document: Some(document.clone()),
                message: message.clone(),
            },
            EngineError::WorldRootMissing(_)
            | EngineError::CodecUnavailable(_)
            | EngineError::InvalidConfig(_) => return None,
        };
        Some(failure)
    }
}

impl ErrorMetadata for EngineError {
    fn error_code(&self) -> &'static str {
        match self {
            EngineError::Io { .. } => "IO_ERROR",
            EngineError::Codec { .. } => "CODEC_ERROR",
            EngineError::Parse { .. } => "PARSE_ERROR",
            EngineError::MissingAsset { .. } => "MISSING_ASSET",
            EngineError::Write { .. } => "WRITE_ERROR",
            EngineError::WorldRootMissing(_) => "WORLD_ROOT_MISSING",
            EngineError::CodecUnavailable(_) => "CODEC_UNAVAILABLE",
            EngineError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::WorldRootMissing(_)
                | EngineError::CodecUnavailable(_)
                | EngineError::InvalidConfig(_)
        )
    }

    fn log_level(&self) -> LogLevel {
        match self {
            _ if self.is_fatal() => LogLevel::Error,
            EngineError::MissingAsset { .. } => LogLevel::Debug,
            _ => LogLevel::Warn,
        }
    }
}
