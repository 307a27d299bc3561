// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Pluggable distance metric: split-plane construction, side selection,
//! margin, and true distance (C6).

use enum_dispatch::enum_dispatch;
use rand::Rng;

use crate::error::{Error, Result};

/// Persisted metric tag (one byte in the Meta File).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Angular = 0,
    Euclidean = 1,
    Manhattan = 2,
    Hamming = 3,
}

impl From<MetricKind> for u8 {
    fn from(value: MetricKind) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MetricKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Angular),
            1 => Ok(Self::Euclidean),
            2 => Ok(Self::Manhattan),
            3 => Ok(Self::Hamming),
            other => Err(Error::Invariant(format!("unknown metric tag {other}"))),
        }
    }
}

/// A split hyperplane's two means are seeded from two random children and
/// refined for this many Lloyd's-algorithm iterations, per spec §4.6.
const TWO_MEANS_ITERATIONS: usize = 200;

/// The metric policy interface: how to build a split, which side of it a
/// vector falls on, how close a vector is to it, and the metric's true
/// pairwise distance.
#[enum_dispatch]
pub trait DistancePolicy {
    /// Builds a hyperplane separating `children` roughly in half via a
    /// two-means seeded by two random children.
    fn create_split(&self, children: &[Vec<f64>], dim: usize, rng: &mut dyn rand::RngCore) -> Vec<f64>;

    /// Which side of `plane` the vector `v` falls on. Exact zero is broken
    /// uniformly at random.
    fn side(&self, plane: &[f64], v: &[f64], rng: &mut dyn rand::RngCore) -> u8;

    /// Signed distance of `v` to `plane` (its dot product).
    fn margin(&self, plane: &[f64], v: &[f64]) -> f64;

    /// True pairwise distance under this metric.
    fn distance(&self, a: &[f64], b: &[f64]) -> f64;
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Lloyd's-algorithm two-means seeded from two random children; returns the
/// difference of the two resulting means (the hyperplane normal).
fn two_means(children: &[Vec<f64>], dim: usize, normalize: bool, rng: &mut dyn rand::RngCore) -> Vec<f64> {
    debug_assert!(children.len() >= 2);

    let i = rng.gen_range(0..children.len());
    let mut j = rng.gen_range(0..children.len() - 1);
    if j >= i {
        j += 1;
    }

    let mut mean_a = children[i].clone();
    let mut mean_b = children[j].clone();

    for _ in 0..TWO_MEANS_ITERATIONS {
        let mut sum_a = vec![0.0; dim];
        let mut sum_b = vec![0.0; dim];
        let mut count_a = 0usize;
        let mut count_b = 0usize;

        for child in children {
            let da = euclidean_sq(child, &mean_a);
            let db = euclidean_sq(child, &mean_b);
            if da < db {
                for (s, x) in sum_a.iter_mut().zip(child) {
                    *s += x;
                }
                count_a += 1;
            } else {
                for (s, x) in sum_b.iter_mut().zip(child) {
                    *s += x;
                }
                count_b += 1;
            }
        }

        if count_a == 0 || count_b == 0 {
            break;
        }

        for x in &mut sum_a {
            *x /= count_a as f64;
        }
        for x in &mut sum_b {
            *x /= count_b as f64;
        }

        let converged = sum_a == mean_a && sum_b == mean_b;
        mean_a = sum_a;
        mean_b = sum_b;

        if converged {
            break;
        }
    }

    let mut plane: Vec<f64> = mean_a.iter().zip(&mean_b).map(|(a, b)| a - b).collect();

    if normalize {
        let n = norm(&plane);
        if n > 0.0 {
            for x in &mut plane {
                *x /= n;
            }
        }
    }

    plane
}

fn euclidean_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn side_from_margin(margin: f64, rng: &mut dyn rand::RngCore) -> u8 {
    use std::cmp::Ordering;
    match margin.partial_cmp(&0.0).unwrap_or(Ordering::Equal) {
        Ordering::Greater => 1,
        Ordering::Less => 0,
        Ordering::Equal => u8::from(rng.gen_bool(0.5)),
    }
}

/// `distance = 2 - 2*cos(theta)`, the angle-derived metric for normalized
/// embeddings; returns 2.0 when either vector has zero norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct AngularMetric;

impl DistancePolicy for AngularMetric {
    fn create_split(&self, children: &[Vec<f64>], dim: usize, rng: &mut dyn rand::RngCore) -> Vec<f64> {
        two_means(children, dim, true, rng)
    }

    fn side(&self, plane: &[f64], v: &[f64], rng: &mut dyn rand::RngCore) -> u8 {
        side_from_margin(dot(plane, v), rng)
    }

    fn margin(&self, plane: &[f64], v: &[f64]) -> f64 {
        dot(plane, v)
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        let na = norm(a);
        let nb = norm(b);
        if na == 0.0 || nb == 0.0 {
            return 2.0;
        }
        let cos = dot(a, b) / (na * nb);
        (2.0 - 2.0 * cos).max(0.0)
    }
}

/// Squared-then-rooted Euclidean (L2) distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMetric;

impl DistancePolicy for EuclideanMetric {
    fn create_split(&self, children: &[Vec<f64>], dim: usize, rng: &mut dyn rand::RngCore) -> Vec<f64> {
        two_means(children, dim, false, rng)
    }

    fn side(&self, plane: &[f64], v: &[f64], rng: &mut dyn rand::RngCore) -> u8 {
        side_from_margin(dot(plane, v), rng)
    }

    fn margin(&self, plane: &[f64], v: &[f64]) -> f64 {
        dot(plane, v)
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        euclidean_sq(a, b).sqrt()
    }
}

/// Manhattan (L1) distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManhattanMetric;

impl DistancePolicy for ManhattanMetric {
    fn create_split(&self, children: &[Vec<f64>], dim: usize, rng: &mut dyn rand::RngCore) -> Vec<f64> {
        two_means(children, dim, false, rng)
    }

    fn side(&self, plane: &[f64], v: &[f64], rng: &mut dyn rand::RngCore) -> u8 {
        side_from_margin(dot(plane, v), rng)
    }

    fn margin(&self, plane: &[f64], v: &[f64]) -> f64 {
        dot(plane, v)
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
    }
}

/// Hamming distance: number of differing coordinates. Unlike the other three
/// metrics, the split plane is not derived from two-means (a mean of
/// categorical coordinates is not meaningful); instead it marks the
/// coordinates where two randomly chosen children disagree.
#[derive(Debug, Clone, Copy, Default)]
pub struct HammingMetric;

impl DistancePolicy for HammingMetric {
    fn create_split(&self, children: &[Vec<f64>], dim: usize, rng: &mut dyn rand::RngCore) -> Vec<f64> {
        let i = rng.gen_range(0..children.len());
        let mut j = rng.gen_range(0..children.len() - 1);
        if j >= i {
            j += 1;
        }

        (0..dim)
            .map(|d| if children[i][d] != children[j][d] { 1.0 } else { 0.0 })
            .collect()
    }

    fn side(&self, plane: &[f64], v: &[f64], rng: &mut dyn rand::RngCore) -> u8 {
        side_from_margin(dot(plane, v) - 0.5 * plane.iter().filter(|&&x| x != 0.0).count() as f64, rng)
    }

    fn margin(&self, plane: &[f64], v: &[f64]) -> f64 {
        dot(plane, v)
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).filter(|(x, y)| x != y).count() as f64
    }
}

/// Enum-dispatched handle to one of the four metric implementations, chosen
/// once at database-creation time.
#[enum_dispatch(DistancePolicy)]
#[derive(Debug, Clone, Copy)]
pub enum Metric {
    Angular(AngularMetric),
    Euclidean(EuclideanMetric),
    Manhattan(ManhattanMetric),
    Hamming(HammingMetric),
}

impl From<MetricKind> for Metric {
    fn from(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Angular => Self::Angular(AngularMetric),
            MetricKind::Euclidean => Self::Euclidean(EuclideanMetric),
            MetricKind::Manhattan => Self::Manhattan(ManhattanMetric),
            MetricKind::Hamming => Self::Hamming(HammingMetric),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    #[test]
    fn angular_distance_is_zero_for_identical_vectors() {
        let metric = AngularMetric;
        let v = vec![0.1, 0.1, 0.0];
        assert!((metric.distance(&v, &v)).abs() < 1e-12);
    }

    #[test]
    fn angular_distance_handles_zero_vectors() {
        let metric = AngularMetric;
        assert_eq!(metric.distance(&[0.0, 0.0], &[1.0, 0.0]), 2.0);
    }

    #[test]
    fn euclidean_and_manhattan_agree_on_axis_aligned_points() {
        let e = EuclideanMetric;
        let m = ManhattanMetric;
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 0.0];
        assert!((e.distance(&a, &b) - 3.0).abs() < 1e-9);
        assert!((m.distance(&a, &b) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn create_split_partitions_children_on_both_sides() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let metric = AngularMetric;
        let children = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![-1.0, 0.0, 0.0],
            vec![-0.9, -0.1, 0.0],
        ];
        let plane = metric.create_split(&children, 3, &mut rng);
        let sides: Vec<u8> = children.iter().map(|c| metric.side(&plane, c, &mut rng)).collect();
        assert!(sides.contains(&0));
        assert!(sides.contains(&1));
    }
}
