//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use crate::atlas::map::KeyFrameId;

/// Message sent from Tracking to Local Mapping when a new keyframe has been
/// inserted into the map.
///
/// Tracking inserts the keyframe itself so the frame history can reference
/// it immediately; Local Mapping then completes it (BoW, database entry,
/// new map points) and forwards it to Loop Closing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewKeyFrameMsg {
    /// The ID assigned to this keyframe by Tracking.
    pub keyframe_id: KeyFrameId,

    /// Id of the frame the keyframe was created from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,
}
