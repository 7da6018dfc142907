//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the nodes of the map graph. Each stores its pose, the raw
//! descriptors it was created from, its map point associations, and its
//! place in the covisibility graph and the spanning tree.
//!
//! The Bag-of-Words vector and the vocabulary handle are process-local and
//! are skipped when the map is serialized; after loading they are restored
//! with [`KeyFrame::set_vocabulary`] and [`KeyFrame::compute_bow`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::vocabulary::{BowVector, Descriptor, Vocabulary};

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    /// Unique identifier, increasing with creation order.
    pub id: KeyFrameId,

    /// Id of the frame this keyframe was promoted from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    /// ORB descriptors, one per feature.
    pub descriptors: Vec<Descriptor>,

    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    #[serde(skip)]
    bow_vector: Option<BowVector>,

    #[serde(skip)]
    vocabulary: Option<Arc<dyn Vocabulary>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    /// None for the root KeyFrame.
    pub parent_id: Option<KeyFrameId>,

    pub children_ids: HashSet<KeyFrameId>,

    /// Pose of this KeyFrame expressed in its parent's frame (T_parent_self).
    /// Recorded when the KeyFrame is culled so frames that used it as their
    /// reference can still be placed by walking up to a live ancestor.
    pub parent_relative: Option<SE3>,

    /// Culled KeyFrames stay in the map but are skipped by every traversal.
    pub is_bad: bool,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        let num_features = descriptors.len();
        Self {
            id,
            frame_id,
            timestamp,
            pose,
            descriptors,
            map_point_ids: vec![None; num_features],
            bow_vector: None,
            vocabulary: None,
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            parent_relative: None,
            is_bad: false,
        }
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// Camera-to-world rotation.
    pub fn rotation_wc(&self) -> UnitQuaternion<f64> {
        self.pose.rotation
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bag-of-Words
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_vocabulary(&mut self, vocabulary: Arc<dyn Vocabulary>) {
        self.vocabulary = Some(vocabulary);
    }

    pub fn has_vocabulary(&self) -> bool {
        self.vocabulary.is_some()
    }

    /// Recompute the BoW vector from the stored descriptors.
    ///
    /// Returns false when no vocabulary is bound.
    pub fn compute_bow(&mut self) -> bool {
        match &self.vocabulary {
            Some(vocabulary) => {
                self.bow_vector = Some(vocabulary.transform(&self.descriptors));
                true
            }
            None => false,
        }
    }

    pub fn bow_vector(&self) -> Option<&BowVector> {
        self.bow_vector.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint. Returns the previous association.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibles(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.covisibility_weights.keys()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn num_features(&self) -> usize {
        self.descriptors.len()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("has_bow", &self.bow_vector.is_some())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingVocabulary;

    impl Vocabulary for CountingVocabulary {
        fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
            let mut bow = BowVector::new();
            for d in descriptors {
                *bow.entry(d[0] as u32).or_insert(0.0) += 1.0;
            }
            bow
        }

        fn num_words(&self) -> usize {
            256
        }
    }

    fn create_test_keyframe(id: u64, num_features: usize) -> KeyFrame {
        KeyFrame::new(
            KeyFrameId::new(id),
            id * 10,
            id as f64 * 0.1,
            SE3::identity(),
            vec![[id as u8; 32]; num_features],
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_test_keyframe(1, 10);

        assert_eq!(kf.set_map_point(3, MapPointId::new(100)), None);
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        // Out of range indices are ignored
        assert_eq!(kf.set_map_point(42, MapPointId::new(1)), None);
        assert_eq!(kf.num_map_points(), 1);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let mut kf = create_test_keyframe(1, 0);
        kf.add_covisibility(KeyFrameId::new(1), 100);
        kf.add_covisibility(KeyFrameId::new(2), 7);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(1)), 0);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(2)), 7);
    }

    #[test]
    fn test_compute_bow_requires_vocabulary() {
        let mut kf = create_test_keyframe(3, 4);
        assert!(!kf.compute_bow());
        assert!(kf.bow_vector().is_none());

        kf.set_vocabulary(Arc::new(CountingVocabulary));
        assert!(kf.compute_bow());
        assert_eq!(kf.bow_vector().unwrap().get(&3), Some(&4.0));
    }

    #[test]
    fn test_bow_not_serialized() {
        let mut kf = create_test_keyframe(2, 3);
        kf.set_vocabulary(Arc::new(CountingVocabulary));
        kf.compute_bow();

        let bytes = bincode::serialize(&kf).unwrap();
        let decoded: KeyFrame = bincode::deserialize(&bytes).unwrap();
        assert!(decoded.bow_vector().is_none());
        assert!(!decoded.has_vocabulary());
        assert_eq!(decoded.descriptors, kf.descriptors);
    }
}
