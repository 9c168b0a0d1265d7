//! Distance metrics
//!
//! All kernels return "lower is better" distances so index and executor
//! ordering is uniform: dot product is negated, cosine is `1 - similarity`.
//! Results are total-ordered via `f32::total_cmp`; embeddings are validated
//! finite at insertion, so NaN never reaches a comparison.

use serde::{Deserialize, Serialize};

/// Distance metric for a library, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// `1 - (a.b)/(|a||b|)`; zero-norm inputs yield distance 1.
    Cosine,
    /// `|a - b|` (L2).
    Euclidean,
    /// `-(a.b)`, negated so lower is better.
    Dot,
}

impl DistanceMetric {
    /// Compute the distance between two equal-length vectors.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::Dot => -dot(a, b),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Dot => "dot",
        };
        write!(f, "{}", name)
    }
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
pub fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    #[test]
    fn test_euclidean() {
        let d = DistanceMetric::Euclidean.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 5.0).abs() < EPS);
    }

    #[test]
    fn test_cosine_identical_vectors() {
        let d = DistanceMetric::Cosine.distance(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]);
        assert!(d.abs() < EPS);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let d = DistanceMetric::Cosine.distance(&[1.0, 0.0], &[0.0, 1.0]);
        assert!((d - 1.0).abs() < EPS);
    }

    #[test]
    fn test_cosine_zero_norm() {
        let d = DistanceMetric::Cosine.distance(&[0.0, 0.0], &[1.0, 1.0]);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn test_dot_is_negated() {
        let d = DistanceMetric::Dot.distance(&[1.0, 2.0], &[3.0, 4.0]);
        assert!((d + 11.0).abs() < EPS);
        // A larger dot product must rank closer.
        let closer = DistanceMetric::Dot.distance(&[1.0, 2.0], &[30.0, 40.0]);
        assert!(closer < d);
    }

    #[test]
    fn test_distances_are_deterministic() {
        let a = [0.1f32, 0.7, -0.3, 0.9];
        let b = [0.4f32, -0.2, 0.8, 0.5];
        for metric in [
            DistanceMetric::Cosine,
            DistanceMetric::Euclidean,
            DistanceMetric::Dot,
        ] {
            assert_eq!(
                metric.distance(&a, &b).to_bits(),
                metric.distance(&a, &b).to_bits()
            );
        }
    }
}
