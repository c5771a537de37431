//! Data models for the engine
//!
//! Records owned by a run (assets, reference sites) and the structures derived from
//! them (dedup groups, redirect plan, run report). Nothing here is persisted.

mod asset;
mod fingerprint;
mod format;
mod media_path;
mod plan;
mod reference;
mod report;

// Re-export all models for convenient imports
pub use asset::*;
pub use fingerprint::*;
pub use format::*;
pub use media_path::*;
pub use plan::*;
pub use reference::*;
pub use report::*;
