//! Worldshrink Core Library
//!
//! This crate provides the domain model, error taxonomy and configuration shared by
//! every stage of the world compression engine: media paths, content fingerprints,
//! asset and reference records, dedup groups, the redirect plan and the run report.

pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, ErrorMetadata, LogLevel};
pub use models::{
    clean_path, AssetRecord, ContentFingerprint, DedupGroup, DocumentId, FailureKind,
    ImageFormat, ItemFailure, MediaPath, OutputAction, OutputTarget, QualityPreset, Redirect,
    RedirectPlan, ReferenceSite, RunReport, SiteLocator, Span, TargetCodec, TranscodeStatus,
};
