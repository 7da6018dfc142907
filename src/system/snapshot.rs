//! Copy of the tracking outputs readable from any thread.

use parking_lot::Mutex;

use crate::atlas::map::MapPointId;
use crate::geometry::SE3;
use crate::tracking::{KeyPoint, TrackedObservations, TrackingEngine, TrackingState};

/// Tracking outputs after the last processed frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingSnapshot {
    pub state: TrackingState,
    pub observations: TrackedObservations,
    /// T_wc of the last frame, if it was tracked.
    pub camera_pose: Option<SE3>,
    pub only_tracking: bool,
}

impl TrackingSnapshot {
    pub fn capture(tracker: &dyn TrackingEngine) -> Self {
        Self {
            state: tracker.state(),
            observations: tracker.current_observations(),
            camera_pose: tracker.current_camera_pose(),
            only_tracking: tracker.is_only_tracking(),
        }
    }
}

/// Mutex-guarded [`TrackingSnapshot`]. Readers get copies.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: Mutex<TrackingSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: TrackingSnapshot) {
        *self.inner.lock() = snapshot;
    }

    pub fn get(&self) -> TrackingSnapshot {
        self.inner.lock().clone()
    }

    pub fn state(&self) -> TrackingState {
        self.inner.lock().state
    }

    pub fn tracked_map_points(&self) -> Vec<Option<MapPointId>> {
        self.inner.lock().observations.map_points.clone()
    }

    pub fn tracked_keypoints_un(&self) -> Vec<KeyPoint> {
        self.inner.lock().observations.keypoints_un.clone()
    }

    pub fn camera_pose(&self) -> Option<SE3> {
        self.inner.lock().camera_pose
    }

    pub fn only_tracking(&self) -> bool {
        self.inner.lock().only_tracking
    }

    /// Publish a mode change ahead of the next full snapshot.
    pub fn set_only_tracking(&self, only_tracking: bool) {
        self.inner.lock().only_tracking = only_tracking;
    }
}
