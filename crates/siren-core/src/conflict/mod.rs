//! Conflict detection and resolution

mod detector;
mod resolution;

pub use detector::{ConflictDetector, Detection, DetectorConfig};
pub use resolution::{Decision, EngineConfig, ResolutionEngine, ResolutionStrategy};

pub(crate) use resolution::manual_merge;
