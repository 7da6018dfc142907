//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! Candidates come from the KeyFrame Database; a candidate is only reported
//! once its region has been detected for several consecutive keyframes.

use std::collections::{HashSet, VecDeque};

use crate::atlas::map::{KeyFrameId, Map};
use crate::atlas::KeyFrameDatabase;
use crate::vocabulary;

/// Configuration for loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Candidates must score at least this fraction of the lowest score
    /// among the keyframe's covisibles.
    pub min_score_ratio: f64,

    /// Number of consecutive keyframes required for temporal consistency.
    pub consistency_threshold: usize,

    /// Maximum candidates requested from the database.
    pub max_candidates: usize,

    /// Minimum id gap between current and loop keyframe.
    pub min_temporal_gap: u64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_score_ratio: 0.75,
            consistency_threshold: 3,
            max_candidates: 10,
            min_temporal_gap: 10,
        }
    }
}

/// A potential loop closure candidate.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    /// Current keyframe ID that detected the loop.
    pub current_kf_id: KeyFrameId,

    /// Loop keyframe ID (the older keyframe we're closing back to).
    pub loop_kf_id: KeyFrameId,

    /// BoW similarity score between current and loop keyframe.
    pub bow_score: f64,

    /// Covisible keyframes of the loop keyframe.
    pub loop_covisibles: Vec<KeyFrameId>,
}

/// Tracks temporal consistency of loop detections.
///
/// A loop is only considered valid if its region is detected for
/// `consistency_threshold` consecutive keyframes.
pub struct ConsistencyChecker {
    threshold: usize,

    /// Candidate regions (candidate + its covisibles) of recent keyframes.
    history: VecDeque<HashSet<KeyFrameId>>,
}

impl ConsistencyChecker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            history: VecDeque::new(),
        }
    }

    /// Add candidates for a new keyframe. Returns the best scoring candidate
    /// whose region reached the threshold, and forgets the history if so.
    pub fn add_and_check(&mut self, candidates: &[LoopCandidate]) -> Option<LoopCandidate> {
        let region: HashSet<KeyFrameId> = candidates
            .iter()
            .flat_map(|c| std::iter::once(c.loop_kf_id).chain(c.loop_covisibles.iter().copied()))
            .collect();

        let consistent = candidates
            .iter()
            .filter(|c| self.region_count(c.loop_kf_id) + 1 >= self.threshold)
            .max_by(|a, b| a.bow_score.total_cmp(&b.bow_score))
            .cloned();

        if consistent.is_some() {
            self.clear();
            return consistent;
        }

        if candidates.is_empty() {
            // A keyframe without candidates breaks every chain.
            self.history.clear();
        } else {
            self.history.push_back(region);
            while self.history.len() > self.threshold {
                self.history.pop_front();
            }
        }
        None
    }

    /// Consecutive most recent keyframes whose region contains `kf_id`.
    fn region_count(&self, kf_id: KeyFrameId) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|region| region.contains(&kf_id))
            .count()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// Detect loop closure candidates for a given keyframe.
///
/// 1. Computes the minimum score among covisible keyframes
/// 2. Queries the KeyFrameDatabase excluding connected keyframes
/// 3. Filters out recent keyframes and low scores
pub fn detect_loop_candidates(
    kf_id: KeyFrameId,
    map: &Map,
    keyframe_db: &KeyFrameDatabase,
    config: &LoopDetectorConfig,
) -> Vec<LoopCandidate> {
    let Some(current_kf) = map.get_keyframe(kf_id) else {
        return vec![];
    };
    let Some(current_bow) = current_kf.bow_vector() else {
        return vec![];
    };

    let mut connected: HashSet<KeyFrameId> = current_kf.covisibles().copied().collect();
    let min_score = connected
        .iter()
        .filter_map(|id| map.get_keyframe(*id)?.bow_vector())
        .map(|bow| vocabulary::score(current_bow, bow))
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))))
        .unwrap_or(0.0);

    connected.insert(kf_id);
    connected.extend(current_kf.parent_id);
    connected.extend(current_kf.children_ids.iter().copied());

    keyframe_db
        .detect_candidates(map, current_bow, &connected, config.max_candidates)
        .into_iter()
        .filter(|c| kf_id.0.abs_diff(c.keyframe_id.0) >= config.min_temporal_gap)
        .filter(|c| c.score > 0.0 && c.score >= min_score * config.min_score_ratio)
        .map(|c| LoopCandidate {
            current_kf_id: kf_id,
            loop_kf_id: c.keyframe_id,
            bow_score: c.score,
            loop_covisibles: map
                .get_keyframe(c.keyframe_id)
                .map(|kf| kf.covisibles().copied().collect())
                .unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::geometry::SE3;
    use crate::vocabulary::{BowVector, Descriptor, Vocabulary};

    fn candidate(current: u64, loop_kf: u64, score: f64, covisibles: &[u64]) -> LoopCandidate {
        LoopCandidate {
            current_kf_id: KeyFrameId::new(current),
            loop_kf_id: KeyFrameId::new(loop_kf),
            bow_score: score,
            loop_covisibles: covisibles.iter().map(|id| KeyFrameId::new(*id)).collect(),
        }
    }

    #[test]
    fn test_consistency_checker() {
        let mut checker = ConsistencyChecker::new(3);
        assert!(checker.add_and_check(&[candidate(10, 1, 0.8, &[2, 3])]).is_none());
        assert!(checker.add_and_check(&[candidate(11, 2, 0.85, &[1])]).is_none());
        let result = checker.add_and_check(&[candidate(12, 1, 0.9, &[])]).unwrap();
        assert_eq!(result.loop_kf_id, KeyFrameId::new(1));

        // History is forgotten after a detection.
        assert!(checker.add_and_check(&[candidate(13, 1, 0.9, &[])]).is_none());
    }

    #[test]
    fn test_consistency_checker_no_match() {
        let mut checker = ConsistencyChecker::new(3);
        for i in 10..15 {
            assert!(checker.add_and_check(&[candidate(i, i - 9, 0.8, &[])]).is_none());
        }
    }

    #[test]
    fn test_empty_keyframe_breaks_chain() {
        let mut checker = ConsistencyChecker::new(3);
        assert!(checker.add_and_check(&[candidate(10, 1, 0.8, &[])]).is_none());
        assert!(checker.add_and_check(&[]).is_none());
        assert!(checker.add_and_check(&[candidate(12, 1, 0.8, &[])]).is_none());
    }

    struct FirstByteVocabulary;

    impl Vocabulary for FirstByteVocabulary {
        fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
            let mut bow = BowVector::new();
            for d in descriptors {
                *bow.entry(d[0] as u32).or_insert(0.0) += 1.0 / descriptors.len() as f64;
            }
            bow
        }

        fn num_words(&self) -> usize {
            256
        }
    }

    #[test]
    fn test_detect_skips_recent_and_connected() {
        let vocab: Arc<dyn Vocabulary> = Arc::new(FirstByteVocabulary);
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new(vocab.clone());
        let mut parent = None;
        for i in 0..15u64 {
            // Keyframes 0 and 14 look alike; everything else is unique.
            let word = if i == 14 { 0 } else { i as u8 };
            let id = map.create_keyframe(i, i as f64, SE3::identity(), vec![[word; 32]], parent);
            let kf = map.get_keyframe_mut(id).unwrap();
            kf.set_vocabulary(vocab.clone());
            kf.compute_bow();
            db.add(id, kf.bow_vector().unwrap());
            parent = Some(id);
        }

        let config = LoopDetectorConfig::default();
        let found = detect_loop_candidates(KeyFrameId::new(14), &map, &db, &config);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].loop_kf_id, KeyFrameId::new(0));

        let strict = LoopDetectorConfig {
            min_temporal_gap: 20,
            ..config
        };
        assert!(detect_loop_candidates(KeyFrameId::new(14), &map, &db, &strict).is_empty());
    }
}
