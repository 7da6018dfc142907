//! KeyFrame decision criteria.

use serde::{Deserialize, Serialize};

/// Thresholds for inserting a new KeyFrame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFrameCriteria {
    /// Always insert after this many frames without a KeyFrame.
    pub max_frames: u64,
    /// Insert once the camera moved this far (metres) from the reference.
    pub min_distance: f64,
    /// Insert when the share of reference MapPoints still tracked drops
    /// below this ratio.
    pub min_tracked_ratio: f64,
}

impl Default for KeyFrameCriteria {
    fn default() -> Self {
        Self {
            max_frames: 20,
            min_distance: 0.25,
            min_tracked_ratio: 0.5,
        }
    }
}

/// Decides whether the current frame becomes a KeyFrame.
///
/// Based on the time since the last KeyFrame, the distance travelled from
/// the reference KeyFrame and the share of its MapPoints still tracked.
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    criteria: KeyFrameCriteria,
    /// Frame counter since last KeyFrame.
    frames_since_kf: u64,
}

impl KeyFrameDecision {
    pub fn new(criteria: KeyFrameCriteria) -> Self {
        Self {
            criteria,
            frames_since_kf: 0,
        }
    }

    /// # Arguments
    /// * `distance` - Distance in metres from the reference KeyFrame
    /// * `tracked_points` - Reference MapPoints matched in the current frame
    /// * `reference_points` - MapPoints observed by the reference KeyFrame
    pub fn should_create_keyframe(
        &mut self,
        distance: f64,
        tracked_points: usize,
        reference_points: usize,
    ) -> bool {
        self.frames_since_kf += 1;

        if self.frames_since_kf >= self.criteria.max_frames {
            self.frames_since_kf = 0;
            return true;
        }

        if distance > self.criteria.min_distance {
            self.frames_since_kf = 0;
            return true;
        }

        // Create KF if tracking quality dropped
        if reference_points > 0 {
            let ratio = tracked_points as f64 / reference_points as f64;
            if ratio < self.criteria.min_tracked_ratio {
                self.frames_since_kf = 0;
                return true;
            }
        }

        false
    }

    /// Reset after KeyFrame creation.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

impl Default for KeyFrameDecision {
    fn default() -> Self {
        Self::new(KeyFrameCriteria::default())
    }
}
