//! k-means clustering of accepted points in (ψ, ρ, q, f, score) space

use super::stats::euclidean;
use crate::services::scorer::PatternSignature;
use chrono::{DateTime, Utc};
use coherence_common::events::ClusterSummary;
use coherence_common::FilteredDataPoint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Stop once no centroid moves more than this (squared distance)
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// Most recent accepted points included in a pass
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

fn default_k() -> usize {
    4
}
fn default_max_iterations() -> usize {
    50
}
fn default_convergence_threshold() -> f64 {
    1e-4
}
fn default_max_points() -> usize {
    500
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            max_iterations: default_max_iterations(),
            convergence_threshold: default_convergence_threshold(),
            max_points: default_max_points(),
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 || self.max_iterations == 0 || self.max_points == 0 {
            return Err("analytics.clustering k/max_iterations/max_points must be positive".to_string());
        }
        if !(self.convergence_threshold >= 0.0) {
            return Err("analytics.clustering.convergence_threshold must be >= 0".to_string());
        }
        Ok(())
    }
}

/// Outcome of one clustering pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringResult {
    /// Non-empty clusters only, renumbered from 0
    pub clusters: Vec<ClusterSummary>,
    /// Majority cluster per pattern signature
    pub labels: Vec<(PatternSignature, usize)>,
    pub points: usize,
    pub iterations: usize,
    pub computed_at: DateTime<Utc>,
}

/// k-means++ seeding followed by Lloyd iterations
///
/// Returns centroids and the final assignment of every vector.
pub fn kmeans(
    vectors: &[[f64; 5]],
    k: usize,
    max_iterations: usize,
    threshold: f64,
    rng: &mut StdRng,
) -> (Vec<[f64; 5]>, Vec<usize>, usize) {
    if vectors.is_empty() || k == 0 {
        return (Vec::new(), Vec::new(), 0);
    }
    let k = k.min(vectors.len());
    let mut centroids = seed_plus_plus(vectors, k, rng);
    let mut assignments = vec![0usize; vectors.len()];
    let mut iterations = 0;

    for _ in 0..max_iterations {
        iterations += 1;
        for (i, v) in vectors.iter().enumerate() {
            assignments[i] = nearest(v, &centroids);
        }

        let mut sums = vec![[0.0f64; 5]; k];
        let mut counts = vec![0usize; k];
        for (v, &ci) in vectors.iter().zip(assignments.iter()) {
            counts[ci] += 1;
            for (s, x) in sums[ci].iter_mut().zip(v.iter()) {
                *s += x;
            }
        }

        let mut max_shift = 0.0f64;
        for ci in 0..k {
            if counts[ci] == 0 {
                continue;
            }
            let mut updated = sums[ci];
            for x in updated.iter_mut() {
                *x /= counts[ci] as f64;
            }
            max_shift = max_shift.max(euclidean(&centroids[ci], &updated).powi(2));
            centroids[ci] = updated;
        }

        if max_shift < threshold {
            break;
        }
    }

    for (i, v) in vectors.iter().enumerate() {
        assignments[i] = nearest(v, &centroids);
    }
    (centroids, assignments, iterations)
}

fn nearest(v: &[f64; 5], centroids: &[[f64; 5]]) -> usize {
    let mut best = (0, f64::MAX);
    for (ci, c) in centroids.iter().enumerate() {
        let d = euclidean(v, c);
        if d < best.1 {
            best = (ci, d);
        }
    }
    best.0
}

fn seed_plus_plus(vectors: &[[f64; 5]], k: usize, rng: &mut StdRng) -> Vec<[f64; 5]> {
    let mut centroids = vec![vectors[rng.gen_range(0..vectors.len())]];
    while centroids.len() < k {
        let weights: Vec<f64> = vectors
            .iter()
            .map(|v| {
                centroids
                    .iter()
                    .map(|c| euclidean(v, c).powi(2))
                    .fold(f64::MAX, f64::min)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            // every remaining vector coincides with a centroid
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut chosen = vectors.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centroids.push(vectors[chosen]);
    }
    centroids
}

/// Cluster `points` and derive per-signature labels
pub fn cluster_points(points: &[FilteredDataPoint], config: &ClusteringConfig, seed: u64) -> ClusteringResult {
    let start = points.len().saturating_sub(config.max_points);
    let points = &points[start..];
    let vectors: Vec<[f64; 5]> = points.iter().map(|p| p.feature_vector()).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let (centroids, assignments, iterations) = kmeans(
        &vectors,
        config.k,
        config.max_iterations,
        config.convergence_threshold,
        &mut rng,
    );

    // drop empty clusters and renumber
    let mut sizes = vec![0usize; centroids.len()];
    for &a in &assignments {
        sizes[a] += 1;
    }
    let mut renumber = HashMap::new();
    let mut clusters = Vec::new();
    for (old, centroid) in centroids.iter().enumerate() {
        if sizes[old] == 0 {
            continue;
        }
        renumber.insert(old, clusters.len());
        clusters.push(ClusterSummary {
            cluster_id: clusters.len(),
            centroid: centroid.to_vec(),
            size: sizes[old],
        });
    }

    let mut votes: BTreeMap<PatternSignature, BTreeMap<usize, usize>> = BTreeMap::new();
    for (point, old) in points.iter().zip(assignments.iter()) {
        if let Some(&cluster) = renumber.get(old) {
            *votes
                .entry(PatternSignature::of(point))
                .or_default()
                .entry(cluster)
                .or_insert(0) += 1;
        }
    }
    let labels = votes
        .into_iter()
        .filter_map(|(signature, counts)| {
            // ties go to the lower cluster id
            counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                .map(|(cluster, _)| (signature, cluster))
        })
        .collect();

    ClusteringResult {
        clusters,
        labels,
        points: points.len(),
        iterations,
        computed_at: Utc::now(),
    }
}
