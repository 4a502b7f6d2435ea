//! Vector math shared by the clusterer, labeler, outlier handler and temporal engine.

use themewatch_common::DistanceMetric;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// `1 - cosine`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    (1.0 - cosine_similarity(a, b)).max(0.0)
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        DistanceMetric::Cosine => cosine_distance(a, b),
        DistanceMetric::Euclidean => euclidean_distance(a, b),
    }
}

/// Scale to unit length in place. Zero vectors are left as is.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

/// Mean of the selected rows. Empty selection gives an empty vector.
pub fn centroid<E: AsRef<[f32]>>(embeddings: &[E], members: &[usize]) -> Vec<f32> {
    let Some(first) = members.first() else {
        return Vec::new();
    };
    let dims = embeddings[*first].as_ref().len();
    let mut sum = vec![0.0f64; dims];
    for &i in members {
        for (acc, x) in sum.iter_mut().zip(embeddings[i].as_ref()) {
            *acc += *x as f64;
        }
    }
    let n = members.len() as f64;
    sum.into_iter().map(|x| (x / n) as f32).collect()
}

/// Mean cosine similarity of the selected rows to `center`. `None` when empty.
pub fn mean_similarity_to<E: AsRef<[f32]>>(
    embeddings: &[E],
    members: &[usize],
    center: &[f32],
) -> Option<f64> {
    if members.is_empty() {
        return None;
    }
    let total: f64 = members
        .iter()
        .map(|&i| cosine_similarity(embeddings[i].as_ref(), center))
        .sum();
    Some(total / members.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&v, &v) < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_distance_one() {
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_vector_similarity_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn normalize_gives_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn centroid_is_member_mean() {
        let rows = vec![vec![1.0, 0.0], vec![3.0, 2.0], vec![100.0, 100.0]];
        assert_eq!(centroid(&rows, &[0, 1]), vec![2.0, 1.0]);
        assert!(centroid(&rows, &[]).is_empty());

        let borrowed: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        assert_eq!(centroid(&borrowed, &[0, 1]), vec![2.0, 1.0]);
        assert!((mean_similarity_to(&borrowed, &[0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn euclidean_matches_pythagoras() {
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-9);
    }
}
