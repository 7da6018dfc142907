//! Tracking front-end.
//!
//! The orchestrator talks to tracking only through [`TrackingEngine`]. The
//! reference [`Tracker`] replays known poses and feeds keyframes to Local
//! Mapping:
//! - Keyframe decision (distance, frame count, tracked ratio)
//! - Descriptor matching against the reference keyframe
//! - Per-frame history relative to reference keyframes

pub mod engine;
pub mod history;
pub mod keyframe_decision;
pub mod matching;
pub mod pose_track;
pub mod state;
pub mod tracker;

pub use engine::{
    DepthImage, KeyPoint, Sensor, SensorInput, TrackedObservations, TrackingEngine,
};
pub use history::{FrameHistory, FrameRecord};
pub use pose_track::PoseTrack;
pub use state::TrackingState;
pub use tracker::{ReplayConfig, Tracker};
