//! Worldshrink Services Layer
//!
//! The stages that need global knowledge of the world: reference scanning over the
//! document corpus, dedup resolution, document rewriting and cleanup, plus the engine
//! that runs them in order. Re-exports the storage and processing types callers need so
//! the CLI depends on a single facade.

pub mod cleanup;
pub mod document;
pub mod engine;
pub mod resolver;
pub mod rewriter;
pub mod scanner;

pub use cleanup::{GarbageCollector, GcInput, GcOutcome};
pub use document::{DocumentKind, ScannedDocument};
pub use engine::{restore_trash, run, scan_only, Engine, ScanReport};
pub use resolver::{AssetResolver, Resolution};
pub use rewriter::{ReferenceRewriter, RewriteOutcome};
pub use scanner::{DocumentFile, ReferenceScanner, ScanOutcome};

pub use worldshrink_processing::{CodecError, CodecInvoker, CommandCodec, MediaMatcher};
pub use worldshrink_storage::{LocalWorldStorage, RestoreSummary, WorldStorage};
