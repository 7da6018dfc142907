//! Descriptor matching by Hamming distance.

use crate::vocabulary::Descriptor;

/// ORB-SLAM matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f32 = 0.75; // Ratio test threshold (best/second_best)

/// Number of differing bits between two 256-bit descriptors.
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Brute-force match `query` against `train`.
///
/// Returns `(query_idx, train_idx)` pairs whose best distance is within
/// `max_distance` and passes the ratio test against the second best. Each
/// train descriptor is used at most once; the closer query wins.
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    max_distance: u32,
) -> Vec<(usize, usize)> {
    let mut best_for_train: Vec<Option<(usize, u32)>> = vec![None; train.len()];

    for (qi, q) in query.iter().enumerate() {
        let mut best = (u32::MAX, usize::MAX);
        let mut second = u32::MAX;
        for (ti, t) in train.iter().enumerate() {
            let d = descriptor_distance(q, t);
            if d < best.0 {
                second = best.0;
                best = (d, ti);
            } else if d < second {
                second = d;
            }
        }

        let (dist, ti) = best;
        if dist > max_distance {
            continue;
        }
        if second != u32::MAX && dist as f32 > NN_RATIO * second as f32 {
            continue;
        }
        match best_for_train[ti] {
            Some((_, prev)) if prev <= dist => {}
            _ => best_for_train[ti] = Some((qi, dist)),
        }
    }

    let mut matches: Vec<(usize, usize)> = best_for_train
        .into_iter()
        .enumerate()
        .filter_map(|(ti, m)| m.map(|(qi, _)| (qi, ti)))
        .collect();
    matches.sort_unstable();
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &b), 0);
        b[0] = 0b1011;
        b[31] = 0xFF;
        assert_eq!(descriptor_distance(&a, &b), 11);
    }

    #[test]
    fn test_match_descriptors_ratio_and_uniqueness() {
        let train = vec![[0u8; 32], [0xFFu8; 32]];
        let mut near_zero = [0u8; 32];
        near_zero[0] = 1;
        let query = vec![near_zero, [0u8; 32], [0xF0u8; 32]];

        let matches = match_descriptors(&query, &train, TH_LOW);
        // query 1 is an exact hit on train 0 and beats query 0; query 2 is
        // too far from both.
        assert_eq!(matches, vec![(1, 0)]);
    }
}
