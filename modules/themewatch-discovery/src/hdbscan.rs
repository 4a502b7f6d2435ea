//! HDBSCAN density clustering.
//!
//! 1. Core distance of a point: distance to its `min_samples`-th nearest point,
//!    counting the point itself.
//! 2. Mutual reachability: `max(core(a), core(b), d(a, b))`.
//! 3. Minimum spanning tree over mutual reachability (dense Prim, O(n^2), no
//!    distance matrix held in memory).
//! 4. Single-linkage hierarchy from the sorted tree edges.
//! 5. Condensed tree: splits where a side is smaller than `min_cluster_size` are
//!    points falling out of the parent, not new clusters.
//! 6. Excess-of-mass selection over cluster stability. The root is never selected,
//!    so a corpus with no density structure yields no clusters.
//!
//! Points not under a selected cluster get the sentinel topic. Cluster ids are
//! numbered by each cluster's lowest member index, so labels are stable for a
//! given input regardless of internal traversal order.

use std::collections::BTreeMap;

use themewatch_common::{DistanceMetric, ThemeWatchError, TopicId, SENTINEL_TOPIC};

use crate::similarity::distance;

/// Smallest distance used when converting to lambda = 1 / distance.
const MIN_DISTANCE: f64 = 1e-12;

pub struct Hdbscan {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub metric: DistanceMetric,
}

/// One merge of the single-linkage hierarchy. Children are point indices
/// (`< n`) or earlier merges (`n + merge index`).
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
enum Child {
    Point(usize),
    Cluster(usize),
}

struct CondensedEdge {
    parent: usize,
    child: Child,
    lambda: f64,
    size: usize,
}

impl Hdbscan {
    /// Label every point with a topic id or the sentinel.
    pub fn fit(&self, points: &[Vec<f32>]) -> Result<Vec<TopicId>, ThemeWatchError> {
        let n = points.len();
        if n < 2 || n < self.min_cluster_size {
            return Ok(vec![SENTINEL_TOPIC; n]);
        }
        if self.min_cluster_size < 2 || self.min_samples == 0 {
            return Err(ThemeWatchError::ClusteringComputation(format!(
                "invalid HDBSCAN parameters: min_cluster_size={}, min_samples={}",
                self.min_cluster_size, self.min_samples
            )));
        }

        let dims = points[0].len();
        if points.iter().any(|p| p.len() != dims) {
            return Err(ThemeWatchError::ClusteringComputation("points have mixed dimensions".into()));
        }
        if points.iter().flatten().any(|x| !x.is_finite()) {
            return Err(ThemeWatchError::ClusteringComputation("points contain non-finite values".into()));
        }

        let core = self.core_distances(points);
        let mst = self.spanning_tree(points, &core);
        let hierarchy = single_linkage(n, mst);
        let condensed = condense(n, &hierarchy, self.min_cluster_size);
        let selected = select_clusters(&condensed);
        Ok(label_points(n, &condensed, &selected))
    }

    fn core_distances(&self, points: &[Vec<f32>]) -> Vec<f64> {
        let n = points.len();
        if self.min_samples <= 1 {
            return vec![0.0; n];
        }
        let k = (self.min_samples - 2).min(n - 2);
        (0..n)
            .map(|i| {
                let mut others: Vec<f64> = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| distance(self.metric, &points[i], &points[j]))
                    .collect();
                let (_, kth, _) = others.select_nth_unstable_by(k, |a, b| a.total_cmp(b));
                *kth
            })
            .collect()
    }

    /// Prim's algorithm over the implicit complete mutual-reachability graph.
    fn spanning_tree(&self, points: &[Vec<f32>], core: &[f64]) -> Vec<(usize, usize, f64)> {
        let n = points.len();
        let mut in_tree = vec![false; n];
        let mut best = vec![f64::INFINITY; n];
        let mut from = vec![0usize; n];
        let mut edges = Vec::with_capacity(n - 1);

        let mut current = 0;
        in_tree[0] = true;
        for _ in 1..n {
            for j in 0..n {
                if in_tree[j] {
                    continue;
                }
                let d = distance(self.metric, &points[current], &points[j]);
                let reach = d.max(core[current]).max(core[j]);
                if reach < best[j] {
                    best[j] = reach;
                    from[j] = current;
                }
            }
            let mut next = usize::MAX;
            for j in 0..n {
                if !in_tree[j] && (next == usize::MAX || best[j] < best[next]) {
                    next = j;
                }
            }
            in_tree[next] = true;
            edges.push((from[next], next, best[next]));
            current = next;
        }
        edges
    }
}

fn single_linkage(n: usize, mut edges: Vec<(usize, usize, f64)>) -> Vec<Merge> {
    edges.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

    let mut parent: Vec<usize> = (0..n).collect();
    let mut node_of: Vec<usize> = (0..n).collect();
    let mut size = vec![1usize; n];

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let mut merges = Vec::with_capacity(n.saturating_sub(1));
    for (a, b, d) in edges {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra == rb {
            continue;
        }
        let merged = size[ra] + size[rb];
        merges.push(Merge {
            left: node_of[ra],
            right: node_of[rb],
            distance: d,
            size: merged,
        });
        parent[rb] = ra;
        size[ra] = merged;
        node_of[ra] = n + merges.len() - 1;
    }
    merges
}

fn node_size(n: usize, merges: &[Merge], node: usize) -> usize {
    if node < n {
        1
    } else {
        merges[node - n].size
    }
}

fn leaves(n: usize, merges: &[Merge], node: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(x) = stack.pop() {
        if x < n {
            out.push(x);
        } else {
            stack.push(merges[x - n].left);
            stack.push(merges[x - n].right);
        }
    }
    out
}

/// Walk the hierarchy top-down, keeping only splits where both sides reach
/// `min_cluster_size`. Condensed cluster 0 is the root.
fn condense(n: usize, merges: &[Merge], min_cluster_size: usize) -> Vec<CondensedEdge> {
    let mut edges = Vec::new();
    let Some(root_merge) = merges.len().checked_sub(1) else {
        return edges;
    };

    let mut next_label = 1;
    let mut stack = vec![(n + root_merge, 0usize)];
    while let Some((node, label)) = stack.pop() {
        let merge = &merges[node - n];
        let lambda = 1.0 / merge.distance.max(MIN_DISTANCE);
        let left_size = node_size(n, merges, merge.left);
        let right_size = node_size(n, merges, merge.right);
        let left_big = left_size >= min_cluster_size;
        let right_big = right_size >= min_cluster_size;

        if left_big && right_big {
            for (child, size) in [(merge.left, left_size), (merge.right, right_size)] {
                let child_label = next_label;
                next_label += 1;
                edges.push(CondensedEdge {
                    parent: label,
                    child: Child::Cluster(child_label),
                    lambda,
                    size,
                });
                stack.push((child, child_label));
            }
            continue;
        }

        for (child, big) in [(merge.left, left_big), (merge.right, right_big)] {
            if big {
                // The cluster carries on under the same label.
                stack.push((child, label));
            } else {
                for p in leaves(n, merges, child) {
                    edges.push(CondensedEdge {
                        parent: label,
                        child: Child::Point(p),
                        lambda,
                        size: 1,
                    });
                }
            }
        }
    }
    edges
}

/// Excess-of-mass selection. Returns the selected condensed cluster labels.
fn select_clusters(edges: &[CondensedEdge]) -> Vec<usize> {
    let mut birth: BTreeMap<usize, f64> = BTreeMap::from([(0, 0.0)]);
    let mut children: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for e in edges {
        if let Child::Cluster(c) = e.child {
            birth.insert(c, e.lambda);
            children.entry(e.parent).or_default().push(c);
        }
    }

    let mut stability: BTreeMap<usize, f64> = birth.keys().map(|c| (*c, 0.0)).collect();
    for e in edges {
        let born = birth.get(&e.parent).copied().unwrap_or(0.0);
        if let Some(s) = stability.get_mut(&e.parent) {
            *s += (e.lambda - born) * e.size as f64;
        }
    }

    let mut selected: BTreeMap<usize, bool> = birth.keys().map(|c| (*c, *c != 0)).collect();
    // Children always carry larger labels than their parent.
    for &cluster in birth.keys().rev().filter(|c| **c != 0) {
        let kids = children.get(&cluster).cloned().unwrap_or_default();
        if kids.is_empty() {
            continue;
        }
        let subtree: f64 = kids.iter().filter_map(|k| stability.get(k)).sum();
        let own = stability.get(&cluster).copied().unwrap_or(0.0);
        if subtree > own {
            selected.insert(cluster, false);
            stability.insert(cluster, subtree);
        } else {
            let mut stack = kids;
            while let Some(k) = stack.pop() {
                selected.insert(k, false);
                if let Some(grand) = children.get(&k) {
                    stack.extend(grand.iter().copied());
                }
            }
        }
    }

    selected
        .into_iter()
        .filter_map(|(c, keep)| keep.then_some(c))
        .collect()
}

fn label_points(n: usize, edges: &[CondensedEdge], selected: &[usize]) -> Vec<TopicId> {
    let mut parent_of: BTreeMap<usize, usize> = BTreeMap::new();
    let mut falls_from = vec![0usize; n];
    for e in edges {
        match e.child {
            Child::Cluster(c) => {
                parent_of.insert(c, e.parent);
            }
            Child::Point(p) => falls_from[p] = e.parent,
        }
    }

    let owner_of = |mut cluster: usize| -> Option<usize> {
        loop {
            if selected.contains(&cluster) {
                return Some(cluster);
            }
            cluster = *parent_of.get(&cluster)?;
        }
    };

    let raw: Vec<Option<usize>> = falls_from.iter().map(|c| owner_of(*c)).collect();

    // Renumber by lowest member index.
    let mut ids: BTreeMap<usize, TopicId> = BTreeMap::new();
    for cluster in raw.iter().flatten() {
        let next = ids.len() as TopicId;
        ids.entry(*cluster).or_insert(next);
    }
    raw.iter()
        .map(|c| c.and_then(|c| ids.get(&c).copied()).unwrap_or(SENTINEL_TOPIC))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(cx: f32, cy: f32, count: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|i| {
                let angle = i as f32 * 0.785;
                vec![cx + 0.1 * angle.cos(), cy + 0.1 * angle.sin()]
            })
            .collect()
    }

    fn euclid(min_cluster_size: usize, min_samples: usize) -> Hdbscan {
        Hdbscan {
            min_cluster_size,
            min_samples,
            metric: DistanceMetric::Euclidean,
        }
    }

    #[test]
    fn two_blobs_and_noise() {
        let mut points = blob(0.0, 0.0, 8);
        points.extend(blob(10.0, 10.0, 8));
        points.push(vec![50.0, -40.0]);
        points.push(vec![-45.0, 60.0]);

        let labels = euclid(5, 3).fit(&points).unwrap();

        assert!(labels[..8].iter().all(|l| *l == 0));
        assert!(labels[8..16].iter().all(|l| *l == 1));
        assert_eq!(labels[16], SENTINEL_TOPIC);
        assert_eq!(labels[17], SENTINEL_TOPIC);
    }

    #[test]
    fn labels_follow_lowest_member_index() {
        // Same blobs, second blob listed first.
        let mut points = blob(10.0, 10.0, 8);
        points.extend(blob(0.0, 0.0, 8));
        let labels = euclid(5, 3).fit(&points).unwrap();
        assert_eq!(labels[0], 0);
        assert_eq!(labels[8], 1);
    }

    #[test]
    fn uniform_noise_yields_no_catch_all_cluster() {
        // A single blob: the root is the only candidate and is never selected.
        let points = blob(0.0, 0.0, 8);
        let labels = euclid(5, 3).fit(&points).unwrap();
        assert!(labels.iter().all(|l| *l == SENTINEL_TOPIC));
    }

    #[test]
    fn fewer_points_than_min_cluster_size_is_all_noise() {
        let points = blob(0.0, 0.0, 3);
        let labels = euclid(5, 3).fit(&points).unwrap();
        assert_eq!(labels, vec![SENTINEL_TOPIC; 3]);
    }

    #[test]
    fn cosine_metric_separates_directions() {
        let mut points: Vec<Vec<f32>> = (0..6).map(|i| vec![1.0, 0.01 * i as f32, 0.0]).collect();
        points.extend((0..6).map(|i| vec![0.0, 0.01 * i as f32, 1.0]));
        let labels = Hdbscan {
            min_cluster_size: 4,
            min_samples: 2,
            metric: DistanceMetric::Cosine,
        }
        .fit(&points)
        .unwrap();
        assert!(labels[..6].iter().all(|l| *l == 0));
        assert!(labels[6..].iter().all(|l| *l == 1));
    }

    #[test]
    fn deterministic_for_identical_input() {
        let mut points = blob(0.0, 0.0, 8);
        points.extend(blob(5.0, 0.0, 8));
        let h = euclid(5, 3);
        assert_eq!(h.fit(&points).unwrap(), h.fit(&points).unwrap());
    }
}
