//! Worldshrink Processing Library
//!
//! Format detection, the media reference predicate, the external codec invoker and the
//! transcode pipeline that produces each dedup group's canonical output.

pub mod codec;
pub mod compression;
pub mod pipeline;
pub mod validator;

// Re-export commonly used types
pub use codec::{CodecError, CodecInvoker, CommandCodec};
pub use compression::EncodeSettings;
pub use pipeline::{TranscodeJob, TranscodeOutcome, TranscodePipeline};
pub use validator::{sniff_format, MediaMatcher, ValidationError};
