//! MapPoint - A 3D landmark observed by KeyFrames.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::vocabulary::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor.
    pub descriptor: Descriptor,

    /// observation[kf_id] = feature index of this point in that KeyFrame.
    pub observations: HashMap<KeyFrameId, usize>,

    /// KeyFrame that created this MapPoint.
    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId) {
        self.observations.remove(&kf_id);
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }
}
