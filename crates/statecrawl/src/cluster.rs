//! Density-based clustering with automatic neighborhood selection
//!
//! The detectors all reduce to the same question: how many clusters does a
//! small set of fingerprints form? This module answers it with DBSCAN over a
//! precomputed distance matrix (arbitrary metric, min-max scaled into
//! `[0, 1]`) or over `hash2vec` feature vectors (Euclidean), with the
//! neighborhood radius chosen automatically.

use std::collections::VecDeque;

use crate::config::{DistanceType, EpsSelection};
use crate::distance;
use crate::error::Result;

/// Label assigned to noise points.
pub const NOISE: i64 = -1;

const UNVISITED: i64 = -2;
const EPS_MARGIN: f64 = 1e-4;
const EPS_FLOOR: f64 = 0.01;

/// Knobs for one clustering call.
#[derive(Debug, Clone)]
pub struct ClusteringOptions {
    /// How pairwise distances are derived from the input values
    pub distance_type: DistanceType,
    /// Neighborhood radius selection strategy
    pub eps_selection: EpsSelection,
    /// DBSCAN core-point threshold
    pub min_samples: usize,
}

impl Default for ClusteringOptions {
    fn default() -> Self {
        Self {
            distance_type: DistanceType::Tlsh,
            eps_selection: EpsSelection::Silhouette,
            min_samples: 1,
        }
    }
}

impl ClusteringOptions {
    /// Options derived from a detector config section.
    pub fn new(distance_type: DistanceType, eps_selection: EpsSelection) -> Self {
        Self {
            distance_type,
            eps_selection,
            min_samples: 1,
        }
    }
}

/// Cluster a set of fingerprints.
///
/// Returns the cluster count and one label per input; `labels[i] == -1`
/// marks noise. A single-element input yields `(0, [-1])`.
pub fn cluster_values(values: &[String], opts: &ClusteringOptions) -> Result<(usize, Vec<i64>)> {
    if values.is_empty() {
        return Ok((0, Vec::new()));
    }
    if values.len() == 1 {
        return Ok((0, vec![NOISE]));
    }

    let matrix = match opts.distance_type {
        DistanceType::Hash2Vec => {
            let features: Vec<Vec<f64>> = values.iter().map(|v| distance::hash2vec(v)).collect();
            feature_distances(&features)
        }
        other => {
            let mut matrix = distance::distance_matrix(values, other)?;
            distance::min_max_scale(&mut matrix);
            matrix
        }
    };
    Ok(cluster_matrix(&matrix, opts))
}

/// Cluster a caller-supplied pairwise distance matrix (the `precomputed`
/// distance type). The matrix is min-max scaled before use.
pub fn cluster_precomputed(
    mut matrix: Vec<Vec<f64>>,
    opts: &ClusteringOptions,
) -> (usize, Vec<i64>) {
    if matrix.is_empty() {
        return (0, Vec::new());
    }
    if matrix.len() == 1 {
        return (0, vec![NOISE]);
    }
    distance::min_max_scale(&mut matrix);
    cluster_matrix(&matrix, opts)
}

fn cluster_matrix(matrix: &[Vec<f64>], opts: &ClusteringOptions) -> (usize, Vec<i64>) {
    let eps = match opts.eps_selection {
        EpsSelection::Silhouette => eps_by_silhouette(matrix, opts.min_samples),
        EpsSelection::Knee => eps_by_knee(matrix, false),
        EpsSelection::KneeDropZeros => eps_by_knee(matrix, true),
        EpsSelection::InfinitesimalFixed => 1e-9,
    };
    dbscan(matrix, eps, opts.min_samples)
}

fn feature_distances(features: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = features.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            matrix[i][j] = distance::euclidean(&features[i], &features[j]);
        }
    }
    matrix
}

/// Sweep eps over `0.1 * m, m in 2..=9` and keep the highest silhouette
/// score; ties break toward the smaller eps.
fn eps_by_silhouette(matrix: &[Vec<f64>], min_samples: usize) -> f64 {
    let mut best_eps = 0.2;
    let mut best_score = f64::NEG_INFINITY;
    for multiplier in 2..10 {
        let eps = 0.1 * f64::from(multiplier);
        let (_, labels) = dbscan(matrix, eps, min_samples);
        let score = silhouette_score(matrix, &labels);
        if score > best_score {
            best_score = score;
            best_eps = eps;
        }
    }
    best_eps
}

/// Eps from the sorted nearest-neighbor distance curve: the distance just
/// after the largest jump, nudged below it.
fn eps_by_knee(matrix: &[Vec<f64>], drop_zeros: bool) -> f64 {
    let mut nn: Vec<f64> = (0..matrix.len())
        .map(|i| {
            matrix[i]
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, d)| *d)
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    if drop_zeros {
        nn.retain(|d| *d != 0.0);
    }
    nn.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if nn.len() < 2 {
        return EPS_FLOOR;
    }

    let distinct = {
        let mut d = nn.clone();
        d.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
        d.len()
    };

    if distinct > 1 {
        let mut max_jump = f64::NEG_INFINITY;
        let mut max_idx = 0;
        for (i, pair) in nn.windows(2).enumerate() {
            let jump = pair[1] - pair[0];
            if jump > max_jump {
                max_jump = jump;
                max_idx = i;
            }
        }
        nn[max_idx + 1] - EPS_MARGIN
    } else if nn[0] == 0.0 {
        EPS_MARGIN
    } else {
        nn[0] - EPS_MARGIN
    }
}

/// Mean silhouette over all points; 0 when the labeling is degenerate.
fn silhouette_score(matrix: &[Vec<f64>], labels: &[i64]) -> f64 {
    let n = labels.len();
    let distinct: std::collections::HashSet<i64> = labels.iter().copied().collect();
    if distinct.len() < 2 || n < 2 {
        return 0.0;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        let own_size = labels.iter().filter(|&&l| l == own).count();
        if own_size < 2 {
            continue;
        }

        let a: f64 = (0..n)
            .filter(|&j| j != i && labels[j] == own)
            .map(|j| matrix[i][j])
            .sum::<f64>()
            / (own_size - 1) as f64;

        let b = distinct
            .iter()
            .filter(|&&l| l != own)
            .map(|&l| {
                let members: Vec<usize> = (0..n).filter(|&j| labels[j] == l).collect();
                members.iter().map(|&j| matrix[i][j]).sum::<f64>() / members.len() as f64
            })
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    total / n as f64
}

/// Plain DBSCAN over a precomputed (row-indexed) distance matrix.
fn dbscan(matrix: &[Vec<f64>], eps: f64, min_samples: usize) -> (usize, Vec<i64>) {
    let n = matrix.len();
    let mut labels = vec![UNVISITED; n];
    let mut cluster: i64 = -1;

    for i in 0..n {
        if labels[i] != UNVISITED {
            continue;
        }
        let neighbors = region_query(matrix, i, eps);
        if neighbors.len() < min_samples {
            labels[i] = NOISE;
            continue;
        }
        cluster += 1;
        labels[i] = cluster;
        let mut queue: VecDeque<usize> = neighbors.into();
        while let Some(j) = queue.pop_front() {
            if labels[j] == NOISE {
                labels[j] = cluster;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = cluster;
            let expansion = region_query(matrix, j, eps);
            if expansion.len() >= min_samples {
                queue.extend(expansion);
            }
        }
    }

    #[allow(clippy::cast_sign_loss)]
    let count = (cluster + 1) as usize;
    (count, labels)
}

fn region_query(matrix: &[Vec<f64>], i: usize, eps: f64) -> Vec<usize> {
    matrix[i]
        .iter()
        .enumerate()
        .filter(|(_, d)| **d <= eps)
        .map(|(j, _)| j)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hashing::HashContext;

    fn opts(distance_type: DistanceType, eps: EpsSelection) -> ClusteringOptions {
        ClusteringOptions::new(distance_type, eps)
    }

    #[test]
    fn test_empty_input() {
        let (k, labels) =
            cluster_values(&[], &opts(DistanceType::Tlsh, EpsSelection::Silhouette)).unwrap();
        assert_eq!(k, 0);
        assert!(labels.is_empty());
    }

    #[test]
    fn test_single_input_is_noise() {
        let (k, labels) = cluster_values(
            &["anything".to_string()],
            &opts(DistanceType::Levenshtein, EpsSelection::Silhouette),
        )
        .unwrap();
        assert_eq!(k, 0);
        assert_eq!(labels, vec![NOISE]);
    }

    #[test]
    fn test_identical_values_form_one_cluster() {
        let values = vec!["abcabc".to_string(); 4];
        let (k, labels) =
            cluster_values(&values, &opts(DistanceType::Levenshtein, EpsSelection::Silhouette))
                .unwrap();
        assert_eq!(k, 1);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_two_well_separated_groups() {
        let ctx = HashContext::new(42);
        let mut values = Vec::new();
        for i in 0..3 {
            values.push(ctx.hash(&format!("GET http /home links page variant {i}")));
        }
        for i in 0..3 {
            values.push(ctx.hash(&format!(
                "POST https /completely/different/universe body payload number {i} \
                 with much longer and structurally unrelated content"
            )));
        }
        let (k, labels) =
            cluster_values(&values, &opts(DistanceType::Tlsh, EpsSelection::Silhouette)).unwrap();
        assert_eq!(k, 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_infinitesimal_eps_separates_distinct_values() {
        let values = vec![
            "aaaa".to_string(),
            "aaaa".to_string(),
            "bbbb".to_string(),
            "cccc".to_string(),
        ];
        let (k, labels) = cluster_values(
            &values,
            &opts(DistanceType::Levenshtein, EpsSelection::InfinitesimalFixed),
        )
        .unwrap();
        assert_eq!(k, 3);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[1], labels[2]);
        assert_ne!(labels[2], labels[3]);
    }

    #[test]
    fn test_hash2vec_clustering() {
        let ctx = HashContext::new(9);
        let values = vec![
            ctx.hash("left hand side content"),
            ctx.hash("left hand side content"),
            ctx.hash("a wholly different right hand side with other words"),
        ];
        let (k, labels) = cluster_values(
            &values,
            &opts(DistanceType::Hash2Vec, EpsSelection::InfinitesimalFixed),
        )
        .unwrap();
        assert_eq!(k, 2);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn test_precomputed_matrix() {
        let matrix = vec![
            vec![0.0, 0.1, 5.0],
            vec![0.1, 0.0, 5.0],
            vec![5.0, 5.0, 0.0],
        ];
        let (k, labels) = cluster_precomputed(
            matrix,
            &opts(DistanceType::Precomputed, EpsSelection::Silhouette),
        );
        assert_eq!(k, 2);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn test_precomputed_single_point() {
        let (k, labels) = cluster_precomputed(
            vec![vec![0.0]],
            &opts(DistanceType::Precomputed, EpsSelection::Silhouette),
        );
        assert_eq!(k, 0);
        assert_eq!(labels, vec![NOISE]);
    }

    #[test]
    fn test_knee_selection_isolates_the_outlier() {
        // Three near-identical values and one far outlier: the knee sits at
        // the outlier's nearest-neighbor distance, and eps lands just below
        // it, keeping the tight group together and the outlier apart.
        let values = vec![
            "aaaaaaaa".to_string(),
            "aaaaaaab".to_string(),
            "aaaaaaac".to_string(),
            "zzzzzzzz".to_string(),
        ];
        let (k, labels) =
            cluster_values(&values, &opts(DistanceType::Levenshtein, EpsSelection::Knee)).unwrap();
        assert_eq!(k, 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_min_samples_two_marks_noise() {
        let values = vec![
            "aaaa".to_string(),
            "aaaa".to_string(),
            "qqqqqqqq".to_string(),
        ];
        let mut options = opts(DistanceType::Levenshtein, EpsSelection::InfinitesimalFixed);
        options.min_samples = 2;
        let (k, labels) = cluster_values(&values, &options).unwrap();
        assert_eq!(k, 1);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], NOISE);
    }
}
