//! Cluster engine: reduce, density-cluster, then describe each cluster by its
//! centroid and distinctive terms.
//!
//! Clustering is a pure function of its inputs. A computation failure surfaces
//! as `ClusteringComputation` with nothing produced; too small a corpus is a
//! normal unsuccessful result, not an error.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{info, warn};

use themewatch_common::{
    Cluster, ClusterParams, DistanceMetric, ThemeWatchError, TopicId, SENTINEL_TOPIC,
};

use crate::hdbscan::Hdbscan;
use crate::reduce::Reducer;
use crate::similarity::centroid;
use crate::terms::{class_tfidf, hashed_vectors};

/// Dimensionality of the bag-of-words vectors used when no embeddings are given.
pub const TEXT_VECTOR_DIMS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResult {
    pub success: bool,
    /// Why clustering was not attempted, when `success` is false.
    pub reason: Option<String>,
    /// Topic per input document, sentinel for unclustered.
    pub labels: Vec<TopicId>,
    pub clusters: Vec<Cluster>,
    /// Input indices labeled with the sentinel, ascending.
    pub outlier_indices: Vec<usize>,
}

impl ClusterResult {
    fn insufficient(found: usize, required: usize) -> Self {
        Self {
            success: false,
            reason: Some(format!(
                "not enough documents: {found} found, {required} required"
            )),
            labels: Vec::new(),
            clusters: Vec::new(),
            outlier_indices: Vec::new(),
        }
    }

    /// Record member document ids on every cluster, from ids parallel to the input.
    pub fn attach_document_ids(&mut self, document_ids: &[String]) {
        for cluster in &mut self.clusters {
            cluster.member_ids = cluster
                .members
                .iter()
                .filter_map(|&i| document_ids.get(i).cloned())
                .collect();
        }
    }
}

impl fmt::Display for ClusterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.success {
            return write!(f, "Clustering skipped: {}", self.reason.as_deref().unwrap_or("unknown"));
        }
        writeln!(f, "=== Clustering Results ===")?;
        writeln!(f, "Documents:  {}", self.labels.len())?;
        writeln!(f, "Clusters:   {}", self.clusters.len())?;
        write!(f, "Outliers:   {}", self.outlier_indices.len())
    }
}

pub struct ClusterEngine {
    params: ClusterParams,
}

impl ClusterEngine {
    pub fn new(params: ClusterParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    /// Cluster `texts`, using `embeddings` when given (parallel to `texts`) and
    /// hashed bag-of-words vectors otherwise.
    pub fn cluster(
        &self,
        texts: &[String],
        embeddings: Option<&[Vec<f32>]>,
    ) -> Result<ClusterResult, ThemeWatchError> {
        let n = texts.len();
        if let Some(e) = embeddings {
            if e.len() != n {
                return Err(ThemeWatchError::Validation(format!(
                    "{} embeddings for {n} texts",
                    e.len()
                )));
            }
        }
        if n < self.params.min_documents {
            info!(
                documents = n,
                required = self.params.min_documents,
                "Not enough documents to cluster"
            );
            return Ok(ClusterResult::insufficient(n, self.params.min_documents));
        }
        self.params.validate()?;

        let hashed;
        let vectors: &[Vec<f32>] = match embeddings {
            Some(e) => e,
            None => {
                hashed = hashed_vectors(texts, TEXT_VECTOR_DIMS);
                &hashed
            }
        };

        let labels = self.compute_labels(vectors).map_err(|e| {
            warn!(error = %e, "Clustering computation failed");
            e
        })?;

        let mut groups: BTreeMap<TopicId, Vec<usize>> = BTreeMap::new();
        let mut outlier_indices = Vec::new();
        for (i, label) in labels.iter().enumerate() {
            if *label == SENTINEL_TOPIC {
                outlier_indices.push(i);
            } else {
                groups.entry(*label).or_default().push(i);
            }
        }

        let classes: Vec<Vec<usize>> = groups.values().cloned().collect();
        let top_terms = class_tfidf(texts, &classes, self.params.top_n_terms);

        let clusters: Vec<Cluster> = groups
            .into_iter()
            .zip(top_terms)
            .map(|((id, members), top_terms)| Cluster {
                id,
                label: String::new(),
                top_terms,
                size: members.len(),
                centroid: centroid(vectors, &members),
                coherence: None,
                representative_docs: Vec::new(),
                members,
                member_ids: Vec::new(),
            })
            .collect();

        info!(
            documents = n,
            clusters = clusters.len(),
            outliers = outlier_indices.len(),
            min_cluster_size = self.params.min_cluster_size,
            min_samples = self.params.min_samples,
            "Clustering complete"
        );

        Ok(ClusterResult {
            success: true,
            reason: None,
            labels,
            clusters,
            outlier_indices,
        })
    }

    /// Reduce, then run HDBSCAN in the reduced space. The configured metric
    /// shapes the input-space neighborhoods; reduced coordinates are compared
    /// with Euclidean distance.
    fn compute_labels(&self, vectors: &[Vec<f32>]) -> Result<Vec<TopicId>, ThemeWatchError> {
        let reduced = Reducer {
            target_dims: self.params.target_dims,
            n_neighbors: self.params.n_neighbors,
            metric: self.params.metric,
        }
        .reduce(vectors)?;

        Hdbscan {
            min_cluster_size: self.params.min_cluster_size,
            min_samples: self.params.min_samples,
            metric: DistanceMetric::Euclidean,
        }
        .fit(&reduced)
    }
}
