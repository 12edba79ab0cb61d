//! Pairwise distances between record fingerprints
//!
//! Wraps the distance types the detectors can be configured with. Edit
//! distances come from `strsim`; TLSH difference comes from [`crate::hashing`];
//! similarity metrics are inverted (`1 - s`) so everything behaves as a
//! distance: non-negative, symmetric, zero on identical inputs.

use crate::config::DistanceType;
use crate::error::{Error, Result};
use crate::hashing;

/// MLIPNS tolerates at most this many raw mismatches before shrinking.
const MLIPNS_MAX_MISMATCHES: usize = 2;
/// MLIPNS similarity threshold on the mismatch ratio.
const MLIPNS_THRESHOLD: f64 = 0.25;

/// Distance between two strings under the given distance type.
///
/// `Hash2Vec` and `Precomputed` are not pairwise string distances and are
/// rejected here; they select a different clustering input instead.
#[allow(clippy::cast_precision_loss)]
pub fn distance(distance_type: DistanceType, a: &str, b: &str) -> Result<f64> {
    let d = match distance_type {
        DistanceType::Tlsh => f64::from(hashing::diff_hex(a, b)?),
        DistanceType::Levenshtein => strsim::levenshtein(a, b) as f64,
        DistanceType::DamerauLevenshtein => strsim::damerau_levenshtein(a, b) as f64,
        DistanceType::Hamming => hamming(a, b) as f64,
        DistanceType::JaroWinklerInverted => 1.0 - strsim::jaro_winkler(a, b),
        DistanceType::MlipnsInverted => 1.0 - mlipns(a, b),
        DistanceType::Hash2Vec | DistanceType::Precomputed => {
            return Err(Error::config(format!(
                "'{distance_type}' does not define a pairwise string distance"
            )))
        }
    };
    Ok(d.max(0.0))
}

/// Mismatching positions plus the length difference.
fn hamming(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mismatches = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
    mismatches + a.len().abs_diff(b.len())
}

/// MLIPNS similarity: 1.0 when the strings agree within the mismatch budget,
/// 0.0 otherwise.
#[allow(clippy::cast_precision_loss)]
fn mlipns(a: &str, b: &str) -> f64 {
    let mut ham = hamming(a, b);
    let mut maxlen = a.chars().count().max(b.chars().count());
    if !a.is_empty() && !b.is_empty() {
        while maxlen > 0 && ham > MLIPNS_MAX_MISMATCHES {
            maxlen -= 1;
            ham -= 1;
        }
    }
    if maxlen == 0 {
        return 1.0;
    }
    if ham as f64 / maxlen as f64 <= MLIPNS_THRESHOLD {
        1.0
    } else {
        0.0
    }
}

/// Pairwise distance matrix over a slice of fingerprints.
pub fn distance_matrix(values: &[String], distance_type: DistanceType) -> Result<Vec<Vec<f64>>> {
    let n = values.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            matrix[i][j] = distance(distance_type, &values[i], &values[j])?;
        }
    }
    Ok(matrix)
}

/// Embed a fingerprint into a numeric vector, one component per character.
///
/// Ordinals `>= 58` are folded down by 7 (compacting the gap between `9` and
/// `A` in the hex alphabet) and the result is normalized on `[48..83]`.
pub fn hash2vec(hash: &str) -> Vec<f64> {
    hash.chars()
        .map(|c| {
            let mut x = f64::from(u32::from(c));
            if x >= 58.0 {
                x -= 7.0;
            }
            (x - 48.0) / 35.0
        })
        .collect()
}

/// Euclidean distance between two `hash2vec` embeddings; components missing
/// from the shorter vector count fully.
pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    let long = a.len().max(b.len());
    (0..long)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0.0);
            let y = b.get(i).copied().unwrap_or(0.0);
            (x - y) * (x - y)
        })
        .sum::<f64>()
        .sqrt()
}

/// Min-max scale each column of a matrix into `[0, 1]`.
///
/// Constant columns become all-zero.
pub fn min_max_scale(matrix: &mut [Vec<f64>]) {
    let Some(width) = matrix.first().map(Vec::len) else {
        return;
    };
    for col in 0..width {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for row in matrix.iter() {
            min = min.min(row[col]);
            max = max.max(row[col]);
        }
        let range = max - min;
        for row in matrix.iter_mut() {
            row[col] = if range > 0.0 {
                (row[col] - min) / range
            } else {
                0.0
            };
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::hashing::HashContext;

    #[test]
    fn test_levenshtein() {
        assert_eq!(
            distance(DistanceType::Levenshtein, "kitten", "sitting").unwrap(),
            3.0
        );
        assert_eq!(distance(DistanceType::Levenshtein, "same", "same").unwrap(), 0.0);
    }

    #[test]
    fn test_hamming_counts_length_difference() {
        assert_eq!(distance(DistanceType::Hamming, "karolin", "kathrin").unwrap(), 3.0);
        assert_eq!(distance(DistanceType::Hamming, "abc", "abcdd").unwrap(), 2.0);
    }

    #[test]
    fn test_damerau_counts_transposition_once() {
        assert_eq!(
            distance(DistanceType::DamerauLevenshtein, "ca", "ac").unwrap(),
            1.0
        );
    }

    #[test]
    fn test_jaro_winkler_inverted_is_a_distance() {
        let same = distance(DistanceType::JaroWinklerInverted, "hash", "hash").unwrap();
        assert_eq!(same, 0.0);
        let different = distance(DistanceType::JaroWinklerInverted, "hash", "zzzz").unwrap();
        assert!(different > 0.0);
        assert!(different <= 1.0);
    }

    #[test]
    fn test_mlipns_inverted_is_binary() {
        assert_eq!(distance(DistanceType::MlipnsInverted, "same", "same").unwrap(), 0.0);
        assert_eq!(
            distance(DistanceType::MlipnsInverted, "abcdefgh", "abcdefgx").unwrap(),
            0.0
        );
        assert_eq!(
            distance(DistanceType::MlipnsInverted, "abcdefgh", "zzzzzzzz").unwrap(),
            1.0
        );
    }

    #[test]
    fn test_tlsh_distance_via_digests() {
        let ctx = HashContext::new(11);
        let a = ctx.hash("first payload");
        let b = ctx.hash("second payload entirely different in content");
        assert_eq!(distance(DistanceType::Tlsh, &a, &a).unwrap(), 0.0);
        let d = distance(DistanceType::Tlsh, &a, &b).unwrap();
        assert!(d > 0.0);
        assert_eq!(d, distance(DistanceType::Tlsh, &b, &a).unwrap());
    }

    #[test]
    fn test_hash2vec_rejected_as_pairwise() {
        assert!(distance(DistanceType::Hash2Vec, "a", "b").is_err());
    }

    #[test]
    fn test_distance_matrix_is_square_with_zero_diagonal() {
        let values = vec!["aaa".to_string(), "aab".to_string(), "zzz".to_string()];
        let matrix = distance_matrix(&values, DistanceType::Levenshtein).unwrap();
        assert_eq!(matrix.len(), 3);
        for (i, row) in matrix.iter().enumerate() {
            assert_eq!(row.len(), 3);
            assert_eq!(row[i], 0.0);
        }
        assert_eq!(matrix[0][1], 1.0);
        assert_eq!(matrix[0][2], 3.0);
    }

    #[test]
    fn test_hash2vec_normalization() {
        // '0' -> 0.0; 'F' folds 70 -> 63 -> (63-48)/35
        let v = hash2vec("0F");
        assert_eq!(v[0], 0.0);
        assert!((v[1] - 15.0 / 35.0).abs() < 1e-12);
    }

    #[test]
    fn test_min_max_scale_columns() {
        let mut m = vec![vec![0.0, 10.0], vec![5.0, 20.0], vec![10.0, 10.0]];
        min_max_scale(&mut m);
        assert_eq!(m[0][0], 0.0);
        assert_eq!(m[1][0], 0.5);
        assert_eq!(m[2][0], 1.0);
        assert_eq!(m[0][1], 0.0);
        assert_eq!(m[1][1], 1.0);
    }

    #[test]
    fn test_min_max_scale_constant_column_is_zeroed() {
        let mut m = vec![vec![3.0], vec![3.0]];
        min_max_scale(&mut m);
        assert_eq!(m, vec![vec![0.0], vec![0.0]]);
    }
}
