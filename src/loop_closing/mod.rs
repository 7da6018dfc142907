//! Loop Closing module.
//!
//! Detects when the camera revisits a mapped place:
//! 1. **Detection** (`detector.rs`): BoW-based loop candidate detection with consistency checking
//! 2. **Thread** (`loop_closer.rs`): Loop closing thread receiving keyframes from Local Mapping
//!
//! # Threading Model
//!
//! The LoopCloser runs in its own thread, receiving keyframe ids from
//! LocalMapping via a channel. It holds read locks while scoring candidates
//! and takes the map write lock only to record an accepted loop.

pub mod detector;
pub mod loop_closer;

pub use detector::{detect_loop_candidates, ConsistencyChecker, LoopCandidate, LoopDetectorConfig};
pub use loop_closer::{LoopCloser, LoopCloserConfig, LoopCloserHandle, LoopCloserStats};
