//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map holds the SLAM graph and is shared by Tracking, Local Mapping and
//! Loop Closing behind an `RwLock`. It provides:
//! - KeyFrame / MapPoint creation with sequential ids
//! - Bidirectional KeyFrame ↔ MapPoint associations (with covisibility)
//! - Spanning tree maintenance, including culling that keeps the culled
//!   KeyFrame reachable for trajectory reconstruction
//! - A "big change" counter bumped by loop corrections, used by readers to
//!   detect that the map was reshaped

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::vocabulary::Descriptor;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The SLAM map containing KeyFrames and MapPoints.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,

    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,

    next_mp_id: u64,

    /// Bumped after every loop closure / global BA.
    big_change_idx: u64,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn next_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    /// Restore both id counters from the stored entities.
    ///
    /// Returns the id the next created frame must take: one past the largest
    /// source frame id of any KeyFrame (0 for an empty map).
    pub fn repair_id_counters(&mut self) -> u64 {
        self.next_kf_id = self.keyframes.keys().map(|id| id.0 + 1).max().unwrap_or(0);
        self.next_mp_id = self.map_points.keys().map(|id| id.0 + 1).max().unwrap_or(0);
        self.keyframes
            .values()
            .map(|kf| kf.frame_id + 1)
            .max()
            .unwrap_or(0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame; the new KeyFrame becomes a child of
    /// `parent` in the spanning tree when one is given.
    pub fn create_keyframe(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        descriptors: Vec<Descriptor>,
        parent: Option<KeyFrameId>,
    ) -> KeyFrameId {
        let id = self.next_keyframe_id();
        let kf = KeyFrame::new(id, frame_id, timestamp, pose, descriptors);
        self.keyframes.insert(id, kf);
        if let Some(parent_id) = parent {
            self.link_parent(id, parent_id);
        }
        id
    }

    /// Add an existing KeyFrame to the map.
    pub fn add_keyframe(&mut self, kf: KeyFrame) {
        if kf.id.0 >= self.next_kf_id {
            self.next_kf_id = kf.id.0 + 1;
        }
        self.keyframes.insert(kf.id, kf);
    }

    /// Set `parent_id` as the spanning tree parent of `child_id`.
    pub fn link_parent(&mut self, child_id: KeyFrameId, parent_id: KeyFrameId) -> bool {
        if child_id == parent_id || !self.keyframes.contains_key(&parent_id) {
            return false;
        }
        let Some(child) = self.keyframes.get_mut(&child_id) else {
            return false;
        };
        let old_parent = child.parent_id.replace(parent_id);
        if let Some(old) = old_parent.and_then(|id| self.keyframes.get_mut(&id)) {
            old.erase_child(child_id);
        }
        if let Some(parent) = self.keyframes.get_mut(&parent_id) {
            parent.add_child(child_id);
        }
        true
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// All KeyFrames, including culled ones, in unspecified order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframes_mut(&mut self) -> impl Iterator<Item = &mut KeyFrame> {
        self.keyframes.values_mut()
    }

    /// All KeyFrames, including culled ones, in ascending creation id order.
    pub fn keyframes_sorted(&self) -> Vec<&KeyFrame> {
        let mut kfs: Vec<&KeyFrame> = self.keyframes.values().collect();
        kfs.sort_by_key(|kf| kf.id);
        kfs
    }

    /// KeyFrame with the highest creation id.
    pub fn last_keyframe(&self) -> Option<&KeyFrame> {
        self.keyframes.values().max_by_key(|kf| kf.id)
    }

    /// KeyFrame with the lowest creation id.
    pub fn first_keyframe(&self) -> Option<&KeyFrame> {
        self.keyframes.values().min_by_key(|kf| kf.id)
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Cull a KeyFrame.
    ///
    /// The KeyFrame stays in the map flagged as bad. Its pose relative to its
    /// parent is recorded, its children are re-attached to that parent, and
    /// its map point observations are dropped. The root cannot be culled.
    pub fn set_bad_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        let Some(parent_id) = kf.parent_id else {
            return false;
        };
        let Some(parent) = self.keyframes.get(&parent_id) else {
            return false;
        };

        let parent_relative = parent.pose.inverse().compose(&kf.pose);
        let children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
        let observations: Vec<MapPointId> = kf.map_point_ids.iter().flatten().copied().collect();
        let covisibles: Vec<KeyFrameId> = kf.covisibles().copied().collect();

        for child_id in children {
            self.link_parent(child_id, parent_id);
        }
        for mp_id in observations {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        if let Some(parent) = self.keyframes.get_mut(&parent_id) {
            parent.erase_child(kf_id);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.parent_relative = Some(parent_relative);
            kf.children_ids.clear();
            kf.is_bad = true;
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = self.next_map_point_id();
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Create a bidirectional association between a KeyFrame feature and a
    /// MapPoint, bumping covisibility with every other observer.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                let observers = mp.observations.keys().copied().collect();
                mp.add_observation(kf_id, feature_idx);
                observers
            }
            None => return false,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            if other_kf_id == kf_id {
                continue;
            }
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that the map was reshaped (loop closure, global BA).
    pub fn inform_new_big_change(&mut self) {
        self.big_change_idx += 1;
    }

    pub fn last_big_change_idx(&self) -> u64 {
        self.big_change_idx
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.big_change_idx = 0;
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("big_change_idx", &self.big_change_idx)
            .finish()
    }
}
