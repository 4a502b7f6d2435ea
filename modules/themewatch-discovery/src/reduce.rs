//! Dimensionality reduction ahead of density clustering.
//!
//! Embeddings are projected onto their top principal components (power iteration
//! with Gram-Schmidt deflation, deterministic start vectors), then each point is
//! pulled halfway toward the mean of its mutual nearest neighbors in the input
//! space. The smoothing tightens dense regions without dragging isolated points
//! into them: a point only moves toward neighbors that also count it as a neighbor.

use themewatch_common::{DistanceMetric, ThemeWatchError};

use crate::similarity::distance;

const MAX_ITERATIONS: usize = 200;
const TOLERANCE: f64 = 1e-9;

pub struct Reducer {
    pub target_dims: usize,
    pub n_neighbors: usize,
    pub metric: DistanceMetric,
}

impl Reducer {
    pub fn reduce(&self, embeddings: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ThemeWatchError> {
        let Some(first) = embeddings.first() else {
            return Ok(Vec::new());
        };
        let dims = first.len();
        if dims == 0 {
            return Err(ThemeWatchError::ClusteringComputation("embeddings have zero dimensions".into()));
        }
        if let Some(i) = embeddings.iter().position(|e| e.len() != dims) {
            return Err(ThemeWatchError::ClusteringComputation(format!(
                "embedding {i} has {} dimensions, expected {dims}",
                embeddings[i].len()
            )));
        }
        if embeddings.iter().flatten().any(|x| !x.is_finite()) {
            return Err(ThemeWatchError::ClusteringComputation("embeddings contain non-finite values".into()));
        }

        let projected = if dims <= self.target_dims {
            embeddings.to_vec()
        } else {
            project(embeddings, self.target_dims)
        };

        if self.n_neighbors == 0 || embeddings.len() < 3 {
            return Ok(projected);
        }
        Ok(smooth(embeddings, &projected, self.n_neighbors, self.metric))
    }
}

/// Project onto the top `k` principal components.
fn project(rows: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
    let n = rows.len();
    let d = rows[0].len();

    let mut mean = vec![0.0f64; d];
    for row in rows {
        for (m, x) in mean.iter_mut().zip(row) {
            *m += *x as f64;
        }
    }
    for m in mean.iter_mut() {
        *m /= n as f64;
    }
    let centered: Vec<Vec<f64>> = rows
        .iter()
        .map(|row| row.iter().zip(&mean).map(|(x, m)| *x as f64 - m).collect())
        .collect();

    let mut components: Vec<Vec<f64>> = Vec::with_capacity(k);
    for c in 0..k {
        match leading_component(&centered, &components, c) {
            Some(v) => components.push(v),
            None => break,
        }
    }

    centered
        .iter()
        .map(|x| {
            let mut out: Vec<f32> = components.iter().map(|v| dot(x, v) as f32).collect();
            out.resize(k, 0.0);
            out
        })
        .collect()
}

/// Power iteration on the implicit covariance `X^T X`, kept orthogonal to the
/// components already found. `None` once the remaining variance is zero.
fn leading_component(x: &[Vec<f64>], found: &[Vec<f64>], seed: usize) -> Option<Vec<f64>> {
    let d = x[0].len();
    let mut v: Vec<f64> = (0..d)
        .map(|j| (((j + 1) * 7919 + seed * 104729) % 1009) as f64 + 1.0)
        .collect();
    orthogonalize(&mut v, found);
    if !unit(&mut v) {
        return None;
    }

    for _ in 0..MAX_ITERATIONS {
        let scores: Vec<f64> = x.iter().map(|row| dot(row, &v)).collect();
        let mut next = vec![0.0f64; d];
        for (row, s) in x.iter().zip(&scores) {
            for (acc, xi) in next.iter_mut().zip(row) {
                *acc += xi * s;
            }
        }
        orthogonalize(&mut next, found);
        if !unit(&mut next) {
            return None;
        }
        let delta: f64 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
        v = next;
        if delta < TOLERANCE {
            break;
        }
    }
    Some(v)
}

fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let p = dot(v, b);
        for (x, y) in v.iter_mut().zip(b) {
            *x -= p * y;
        }
    }
}

fn unit(v: &mut [f64]) -> bool {
    let norm = dot(v, v).sqrt();
    if norm < 1e-12 {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Move each point halfway toward the mean of its mutual k nearest neighbors,
/// with neighborhoods measured in the input space.
fn smooth(
    input: &[Vec<f32>],
    projected: &[Vec<f32>],
    n_neighbors: usize,
    metric: DistanceMetric,
) -> Vec<Vec<f32>> {
    let n = input.len();
    let k = n_neighbors.min(n - 1);

    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            let mut others: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (distance(metric, &input[i], &input[j]), j))
                .collect();
            others.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
            others.truncate(k);
            others.into_iter().map(|(_, j)| j).collect()
        })
        .collect();

    (0..n)
        .map(|i| {
            let mutual: Vec<usize> = neighbors[i]
                .iter()
                .copied()
                .filter(|j| neighbors[*j].contains(&i))
                .collect();
            if mutual.is_empty() {
                return projected[i].clone();
            }
            let dims = projected[i].len();
            let mut mean = vec![0.0f64; dims];
            for &j in &mutual {
                for (m, x) in mean.iter_mut().zip(&projected[j]) {
                    *m += *x as f64;
                }
            }
            projected[i]
                .iter()
                .zip(mean)
                .map(|(x, m)| ((*x as f64 + m / mutual.len() as f64) / 2.0) as f32)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reducer(target_dims: usize, n_neighbors: usize) -> Reducer {
        Reducer {
            target_dims,
            n_neighbors,
            metric: DistanceMetric::Euclidean,
        }
    }

    #[test]
    fn projects_to_target_dims() {
        let rows: Vec<Vec<f32>> = (0..10)
            .map(|i| (0..8).map(|j| ((i * 3 + j * 5) % 7) as f32).collect())
            .collect();
        let out = reducer(3, 0).reduce(&rows).unwrap();
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|r| r.len() == 3));
    }

    #[test]
    fn low_dimensional_input_passes_through() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert_eq!(reducer(5, 0).reduce(&rows).unwrap(), rows);
    }

    #[test]
    fn first_component_follows_dominant_axis() {
        // Variance lies almost entirely along the first input axis.
        let rows: Vec<Vec<f32>> = (0..20)
            .map(|i| vec![i as f32, 0.01 * (i % 2) as f32, 0.0])
            .collect();
        let out = reducer(2, 0).reduce(&rows).unwrap();
        let spread = |c: usize| {
            let vals: Vec<f32> = out.iter().map(|r| r[c]).collect();
            vals.iter().cloned().fold(f32::MIN, f32::max) - vals.iter().cloned().fold(f32::MAX, f32::min)
        };
        assert!(spread(0) > 15.0);
        assert!(spread(1) < 0.1);
    }

    #[test]
    fn projection_is_deterministic() {
        let rows: Vec<Vec<f32>> = (0..12)
            .map(|i| (0..6).map(|j| ((i * j + 1) % 5) as f32).collect())
            .collect();
        let r = reducer(2, 3);
        assert_eq!(r.reduce(&rows).unwrap(), r.reduce(&rows).unwrap());
    }

    #[test]
    fn isolated_point_is_not_smoothed() {
        let mut rows: Vec<Vec<f32>> = (0..4).map(|i| vec![i as f32 * 0.1, 0.0]).collect();
        rows.push(vec![100.0, 100.0]);
        let out = reducer(5, 2).reduce(&rows).unwrap();
        assert_eq!(out[4], vec![100.0, 100.0]);
    }

    #[test]
    fn mismatched_dimensions_are_a_computation_error() {
        let rows = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            reducer(1, 0).reduce(&rows),
            Err(ThemeWatchError::ClusteringComputation(_))
        ));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let rows = vec![vec![1.0, f32::NAN], vec![1.0, 2.0]];
        assert!(reducer(1, 0).reduce(&rows).is_err());
    }
}
