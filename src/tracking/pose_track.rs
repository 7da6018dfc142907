//! Timestamped camera poses replayed by the reference tracker.

use crate::geometry::SE3;

/// Camera-to-world poses sorted by timestamp (seconds).
#[derive(Debug, Clone, Default)]
pub struct PoseTrack {
    samples: Vec<(f64, SE3)>,
}

impl PoseTrack {
    pub fn new(mut samples: Vec<(f64, SE3)>) -> Self {
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Pose of the sample nearest to `timestamp`, if it lies within
    /// `tolerance` seconds.
    pub fn pose_at(&self, timestamp: f64, tolerance: f64) -> Option<SE3> {
        let idx = self.samples.partition_point(|(t, _)| *t < timestamp);
        [idx.checked_sub(1), Some(idx)]
            .into_iter()
            .flatten()
            .filter_map(|i| self.samples.get(i))
            .min_by(|a, b| (a.0 - timestamp).abs().total_cmp(&(b.0 - timestamp).abs()))
            .filter(|(t, _)| (t - timestamp).abs() <= tolerance)
            .map(|(_, pose)| *pose)
    }
}
