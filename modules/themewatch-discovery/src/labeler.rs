//! Topic labeler: human labels, representative excerpts, coherence, and merge
//! suggestions.
//!
//! Labels, excerpts and coherence are filled in while a run's clusters are being
//! built. Merge suggestions only read clusters; merging is left to a person.

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use themewatch_common::{Cluster, LabelerConfig, TopicId};

use crate::similarity::{cosine_distance, cosine_similarity};
use crate::terms::is_label_term;

const FALLBACK_PREFIX: &str = "Topic_";

/// Two topics whose labels share enough terms that a reviewer may want to merge them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MergeSuggestion {
    pub topic_a: TopicId,
    pub topic_b: TopicId,
    /// Jaccard similarity of the two label term sets.
    pub similarity: f64,
    pub shared_terms: Vec<String>,
}

pub struct TopicLabeler {
    config: LabelerConfig,
}

impl TopicLabeler {
    pub fn new(config: LabelerConfig) -> Self {
        Self { config }
    }

    /// Label each cluster from its top terms: the best `label_words` terms that
    /// are not stopwords and longer than two characters, joined with `_`. Falls
    /// back to the unfiltered top terms, then to `Topic_<id>`.
    pub fn generate_labels(&self, clusters: &mut [Cluster]) {
        for cluster in clusters.iter_mut() {
            cluster.label = self.label_for(cluster);
        }
    }

    fn label_for(&self, cluster: &Cluster) -> String {
        let n = self.config.label_words;

        let filtered: Vec<&str> = cluster
            .top_terms
            .iter()
            .map(|t| t.term.as_str())
            .filter(|t| is_label_term(t))
            .take(n)
            .collect();
        if !filtered.is_empty() {
            return filtered.join("_");
        }

        let unfiltered: Vec<&str> = cluster
            .top_terms
            .iter()
            .map(|t| t.term.as_str())
            .filter(|t| !t.is_empty())
            .take(n)
            .collect();
        if !unfiltered.is_empty() {
            return unfiltered.join("_");
        }

        format!("{FALLBACK_PREFIX}{}", cluster.id)
    }

    /// Attach up to `max_excerpts` excerpts per cluster: the members closest to
    /// the centroid, ties by input order, each capped at `excerpt_chars`
    /// characters.
    pub fn enhance_with_representative_docs(
        &self,
        clusters: &mut [Cluster],
        texts: &[String],
        embeddings: &[Vec<f32>],
    ) {
        for cluster in clusters.iter_mut() {
            let mut ranked: Vec<(f64, usize)> = cluster
                .members
                .iter()
                .filter(|&&i| texts.get(i).is_some_and(|t| !t.trim().is_empty()))
                .filter_map(|&i| {
                    embeddings
                        .get(i)
                        .map(|e| (cosine_distance(e, &cluster.centroid), i))
                })
                .collect();
            ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            cluster.representative_docs = ranked
                .into_iter()
                .take(self.config.max_excerpts)
                .map(|(_, i)| excerpt(&texts[i], self.config.excerpt_chars))
                .collect();
        }
    }

    /// Mean pairwise cosine similarity of members, self-pairs excluded. A
    /// singleton is exactly 1.0; an empty cluster has no score. Large clusters
    /// are scored on an evenly spaced sample of `coherence_sample` members.
    pub fn calculate_coherence_scores(&self, clusters: &mut [Cluster], embeddings: &[Vec<f32>]) {
        for cluster in clusters.iter_mut() {
            cluster.coherence = coherence(&cluster.members, embeddings, self.config.coherence_sample);
            debug!(topic = cluster.id, coherence = ?cluster.coherence, "Coherence computed");
        }
    }

    /// Suggest merges between clusters whose label term sets overlap at or above
    /// `merge_threshold`. Clusters still on the `Topic_<id>` fallback have no
    /// terms to compare and are skipped.
    pub fn merge_similar_topics(&self, clusters: &[Cluster]) -> Vec<MergeSuggestion> {
        let term_sets: Vec<(TopicId, BTreeSet<String>)> = clusters
            .iter()
            .filter(|c| !is_fallback_label(&c.label, c.id))
            .map(|c| (c.id, label_terms(&c.label)))
            .filter(|(_, terms)| !terms.is_empty())
            .collect();

        let mut suggestions = Vec::new();
        for (i, (a_id, a_terms)) in term_sets.iter().enumerate() {
            for (b_id, b_terms) in &term_sets[i + 1..] {
                let shared: Vec<String> = a_terms.intersection(b_terms).cloned().collect();
                let union = a_terms.union(b_terms).count();
                let similarity = shared.len() as f64 / union as f64;
                if similarity >= self.config.merge_threshold {
                    suggestions.push(MergeSuggestion {
                        topic_a: (*a_id).min(*b_id),
                        topic_b: (*a_id).max(*b_id),
                        similarity,
                        shared_terms: shared,
                    });
                }
            }
        }

        suggestions.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.topic_a.cmp(&b.topic_a))
                .then(a.topic_b.cmp(&b.topic_b))
        });
        info!(suggestions = suggestions.len(), "Merge suggestions computed");
        suggestions
    }

    /// Labels, excerpts and coherence in one pass.
    pub fn label_clusters(&self, clusters: &mut [Cluster], texts: &[String], embeddings: &[Vec<f32>]) {
        self.generate_labels(clusters);
        self.enhance_with_representative_docs(clusters, texts, embeddings);
        self.calculate_coherence_scores(clusters, embeddings);
    }
}

fn coherence(members: &[usize], embeddings: &[Vec<f32>], sample: usize) -> Option<f64> {
    match members.len() {
        0 => return None,
        1 => return Some(1.0),
        _ => {}
    }

    let picked: Vec<&[f32]> = if members.len() > sample && sample >= 2 {
        (0..sample)
            .map(|k| members[k * members.len() / sample])
            .filter_map(|i| embeddings.get(i).map(Vec::as_slice))
            .collect()
    } else {
        members
            .iter()
            .filter_map(|&i| embeddings.get(i).map(Vec::as_slice))
            .collect()
    };
    if picked.len() < 2 {
        return None;
    }

    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..picked.len() {
        for j in (i + 1)..picked.len() {
            total += cosine_similarity(picked[i], picked[j]);
            pairs += 1;
        }
    }
    Some(total / pairs as f64)
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

fn label_terms(label: &str) -> BTreeSet<String> {
    label
        .split('_')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_fallback_label(label: &str, id: TopicId) -> bool {
    label == format!("{FALLBACK_PREFIX}{id}")
}
