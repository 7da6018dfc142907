//! KeyFrameDatabase - place recognition index.
//!
//! An inverted file from visual word to the KeyFrames containing it. The
//! index itself is persisted with the map; the vocabulary is not and must be
//! rebound with [`KeyFrameDatabase::set_vocabulary`] after loading.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrameId, Map};
use crate::vocabulary::{self, BowVector, Vocabulary};

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

#[derive(Default, Serialize, Deserialize)]
pub struct KeyFrameDatabase {
    /// word_id -> KeyFrames whose BoW vector contains the word.
    inverted_file: HashMap<u32, HashSet<KeyFrameId>>,

    #[serde(skip)]
    vocabulary: Option<Arc<dyn Vocabulary>>,
}

impl KeyFrameDatabase {
    pub fn new(vocabulary: Arc<dyn Vocabulary>) -> Self {
        Self {
            inverted_file: HashMap::new(),
            vocabulary: Some(vocabulary),
        }
    }

    pub fn set_vocabulary(&mut self, vocabulary: Arc<dyn Vocabulary>) {
        self.vocabulary = Some(vocabulary);
    }

    pub fn vocabulary(&self) -> Option<&Arc<dyn Vocabulary>> {
        self.vocabulary.as_ref()
    }

    /// Index a keyframe under every word of its BoW vector.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word_id in bow.keys() {
            self.inverted_file.entry(*word_id).or_default().insert(kf_id);
        }
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        self.inverted_file.retain(|_, kfs| {
            kfs.remove(&kf_id);
            !kfs.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inverted_file.is_empty()
    }

    /// KeyFrames sharing at least one word with `query`, best L1 score first.
    ///
    /// Culled keyframes and the ids in `exclude` are skipped.
    pub fn detect_candidates(
        &self,
        map: &Map,
        query: &BowVector,
        exclude: &HashSet<KeyFrameId>,
        max_results: usize,
    ) -> Vec<Candidate> {
        let sharing: HashSet<KeyFrameId> = query
            .keys()
            .filter_map(|word| self.inverted_file.get(word))
            .flatten()
            .copied()
            .filter(|id| !exclude.contains(id))
            .collect();

        let mut candidates: Vec<Candidate> = sharing
            .into_iter()
            .filter_map(|kf_id| {
                let kf = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad)?;
                let bow = kf.bow_vector()?;
                Some(Candidate {
                    keyframe_id: kf_id,
                    score: vocabulary::score(query, bow),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(max_results);
        candidates
    }
}

impl std::fmt::Debug for KeyFrameDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrameDatabase")
            .field("num_words", &self.inverted_file.len())
            .field("has_vocabulary", &self.vocabulary.is_some())
            .finish()
    }
}
