//! Visual vocabulary used to turn keyframe descriptors into Bag-of-Words vectors.
//!
//! The vocabulary is process-local: it is never written into a map file and
//! has to be rebound to the keyframe database and to every keyframe after a
//! map is loaded.
//!
//! [`OrbVocabulary`] reads the DBoW2 text format (hierarchical k-means tree of
//! ORB descriptors). Anything implementing [`Vocabulary`] can stand in for it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::SystemError;

/// 256-bit binary ORB descriptor.
pub type Descriptor = [u8; 32];

/// Bag-of-Words vector: word_id -> L1-normalized weight.
pub type BowVector = HashMap<u32, f64>;

/// Quantizes descriptors into a Bag-of-Words vector.
pub trait Vocabulary: Send + Sync {
    fn transform(&self, descriptors: &[Descriptor]) -> BowVector;

    fn num_words(&self) -> usize;
}

/// L1 similarity between two BoW vectors, in [0, 1].
pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
    let mut diff_sum = 0.0;
    for (word_id, w1) in v1 {
        let w2 = v2.get(word_id).copied().unwrap_or(0.0);
        diff_sum += (w1 - w2).abs();
    }
    for (word_id, w2) in v2 {
        if !v1.contains_key(word_id) {
            diff_sum += w2.abs();
        }
    }
    1.0 - 0.5 * diff_sum
}

#[derive(Debug, Clone)]
struct VocabNode {
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn root() -> Self {
        Self {
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

/// ORB vocabulary tree in DBoW2 layout.
#[derive(Debug)]
pub struct OrbVocabulary {
    /// nodes[0] is the root.
    nodes: Vec<VocabNode>,
    num_words: usize,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load a vocabulary, picking the reader from the file extension.
    ///
    /// Only the `.txt` DBoW2 layout is understood; any other extension, a
    /// missing file, or a malformed file is a fatal configuration error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SystemError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") => Self::load_from_text(path),
            _ => Err(SystemError::Vocabulary {
                path: path.to_path_buf(),
                reason: "unsupported vocabulary format (expected .txt)".to_string(),
            }),
        }
    }

    /// Load from DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] ... desc[31] weight
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, SystemError> {
        let path = path.as_ref();
        let fail = |reason: String| SystemError::Vocabulary {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| fail(format!("cannot open: {e}")))?;
        let mut lines = BufReader::new(file).lines();

        let header = lines
            .next()
            .ok_or_else(|| fail("empty vocabulary file".to_string()))?
            .map_err(|e| fail(e.to_string()))?;
        let mut header_parts = header.split_whitespace();
        let k: usize = header_parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| fail("invalid branching factor in header".to_string()))?;
        let l: usize = header_parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| fail("invalid depth in header".to_string()))?;

        let mut nodes = vec![VocabNode::root()];
        let mut num_words = 0u32;

        for (line_idx, line) in lines.enumerate() {
            let line = line.map_err(|e| fail(e.to_string()))?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            // parent, leaf flag, 32 descriptor bytes, weight
            if parts.len() < 35 {
                continue;
            }
            let line_no = line_idx + 2;

            let parent_id: u32 = parts[0]
                .parse()
                .map_err(|_| fail(format!("invalid parent id at line {line_no}")))?;
            let is_leaf = parts[1] == "1";

            let mut descriptor = [0u8; 32];
            for (byte, text) in descriptor.iter_mut().zip(&parts[2..34]) {
                *byte = text
                    .parse()
                    .map_err(|_| fail(format!("invalid descriptor byte at line {line_no}")))?;
            }
            let weight: f64 = parts[34]
                .parse()
                .map_err(|_| fail(format!("invalid weight at line {line_no}")))?;

            let node_id = nodes.len() as u32;
            let word_id = if is_leaf {
                num_words += 1;
                Some(num_words - 1)
            } else {
                None
            };
            if let Some(parent) = nodes.get_mut(parent_id as usize) {
                parent.children.push(node_id);
            }
            nodes.push(VocabNode {
                children: Vec::new(),
                descriptor,
                weight,
                word_id,
            });
        }

        if num_words == 0 {
            return Err(fail("vocabulary has no words".to_string()));
        }

        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            k,
            l,
            nodes.len(),
            num_words
        );

        Ok(Self {
            nodes,
            num_words: num_words as usize,
            k,
            l,
        })
    }

    /// Branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    /// Descend from the root following the closest child; returns (word, leaf).
    fn quantize(&self, desc: &Descriptor) -> (u32, usize) {
        let mut node_id = 0usize;
        while let Some((&first, rest)) = self.nodes[node_id].children.split_first() {
            let mut best = first;
            let mut best_dist = hamming_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in rest {
                let dist = hamming_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best = child;
                }
            }
            node_id = best as usize;
        }
        (self.nodes[node_id].word_id.unwrap_or(0), node_id)
    }
}

impl Vocabulary for OrbVocabulary {
    fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for desc in descriptors {
            let (word_id, leaf) = self.quantize(desc);
            *bow.entry(word_id).or_insert(0.0) += self.nodes[leaf].weight;
        }
        normalize_l1(&mut bow);
        bow
    }

    fn num_words(&self) -> usize {
        self.num_words
    }
}

fn normalize_l1(bow: &mut BowVector) {
    let sum: f64 = bow.values().sum();
    if sum > 0.0 {
        for v in bow.values_mut() {
            *v /= sum;
        }
    }
}

#[inline]
fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Two-word tree: one leaf with all-zero descriptor, one with all-ones.
    fn write_tiny_vocabulary(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("voc.txt");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "2 1 0 0").unwrap();
        let zeros = vec!["0"; 32].join(" ");
        let ones = vec!["255"; 32].join(" ");
        writeln!(f, "0 1 {zeros} 1.0").unwrap();
        writeln!(f, "0 1 {ones} 3.0").unwrap();
        path
    }

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; 32];
        let mut c = [0u8; 32];
        assert_eq!(hamming_distance(&a, &c), 0);
        c[0] = 0xFF;
        c[1] = 0x0F;
        assert_eq!(hamming_distance(&a, &c), 12);
    }

    #[test]
    fn test_bow_score() {
        let v1: BowVector = [(0, 0.5), (1, 0.5)].into_iter().collect();
        let v2 = v1.clone();
        assert!((score(&v1, &v2) - 1.0).abs() < 1e-10);

        let v3: BowVector = [(2, 0.5), (3, 0.5)].into_iter().collect();
        assert!(score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_load_and_transform() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = OrbVocabulary::load(write_tiny_vocabulary(dir.path())).unwrap();
        assert_eq!(vocab.num_words(), 2);
        assert_eq!(vocab.params(), (2, 1));

        let bow = vocab.transform(&[[0u8; 32], [0u8; 32], [255u8; 32]]);
        // weights 1 + 1 for word 0, 3 for word 1, normalized by 5
        assert!((bow[&0] - 0.4).abs() < 1e-12);
        assert!((bow[&1] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_missing_vocabulary_is_fatal() {
        let err = OrbVocabulary::load("/nonexistent/voc.txt").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let err = OrbVocabulary::load("voc.bin").unwrap_err();
        assert!(matches!(err, SystemError::Vocabulary { .. }));
    }
}
