pub mod service;

pub use service::{GarbageCollector, GcInput, GcOutcome};
