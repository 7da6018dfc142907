//! Per-frame trajectory record kept by Tracking.
//!
//! Each processed frame stores its pose relative to a reference keyframe
//! rather than in world coordinates. Keyframe poses move when the map is
//! optimized; storing relatives lets the exporter rebuild every frame's
//! world pose from the final keyframe poses.

use crate::atlas::map::KeyFrameId;
use crate::geometry::SE3;

/// One processed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRecord {
    /// Pose of the camera in the reference keyframe's frame (T_ref_cam).
    pub relative_pose: SE3,
    pub reference_kf: KeyFrameId,
    pub timestamp: f64,
    /// Tracking had failed for this frame; the relative pose is the last
    /// good one repeated.
    pub lost: bool,
}

/// Ordered frame records of one map session.
#[derive(Debug, Clone, Default)]
pub struct FrameHistory {
    records: Vec<FrameRecord>,
}

impl FrameHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: FrameRecord) {
        self.records.push(record);
    }

    /// Append a lost frame that repeats the last known relative pose.
    ///
    /// Does nothing if no frame has been recorded yet.
    pub fn push_lost(&mut self, timestamp: f64) -> bool {
        let Some(last) = self.records.last().copied() else {
            return false;
        };
        self.records.push(FrameRecord {
            timestamp,
            lost: true,
            ..last
        });
        true
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&FrameRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{UnitQuaternion, Vector3};

    use super::*;

    #[test]
    fn test_push_lost_repeats_last_relative_pose() {
        let mut history = FrameHistory::new();
        assert!(!history.push_lost(0.0));
        assert!(history.is_empty());

        let rel = SE3::from_rt(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, 0.0));
        history.push(FrameRecord {
            relative_pose: rel,
            reference_kf: KeyFrameId::new(3),
            timestamp: 1.0,
            lost: false,
        });
        assert!(history.push_lost(1.1));

        let last = history.last().unwrap();
        assert!(last.lost);
        assert_eq!(last.reference_kf, KeyFrameId::new(3));
        assert_eq!(last.relative_pose, rel);
        assert!((last.timestamp - 1.1).abs() < 1e-12);
        assert_eq!(history.len(), 2);
    }
}
