//! Worldshrink Storage Library
//!
//! Filesystem access for one world: listing files, reading and atomically replacing
//! them, staging removals in a trash directory, and streaming content fingerprints.
//!
//! # Key format
//!
//! Keys are `/`-separated paths relative to the reference root (the directory document
//! paths are written against), e.g. `worlds/my-world/scenes/map.png`. Keys must not
//! contain `..` or a leading `/`.

pub mod hasher;
pub mod local;
pub mod traits;

// Re-export commonly used types
pub use hasher::{fingerprint, fingerprint_bytes, FileDigest, SNIFF_LEN};
pub use local::LocalWorldStorage;
pub use traits::{FileEntry, RestoreSummary, StorageError, StorageResult, WorldStorage};
