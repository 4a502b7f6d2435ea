//! Views of a run's clusters handed to the external stages.
//!
//! Enrichment gets `ClusterSummary` (no embeddings). Gap analysis gets
//! `OwnershipPartition`: the same clusters split by which population published
//! their members.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use themewatch_common::{Cluster, Owner, TemporalMetric, TopTerm, TopicId};

use crate::fetcher::FetchedCorpus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterSummary {
    pub topic_id: TopicId,
    pub label: String,
    pub top_terms: Vec<TopTerm>,
    pub size: usize,
    pub coherence: Option<f64>,
    pub excerpts: Vec<String>,
    pub temporal_metrics: Vec<TemporalMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OwnershipPartition {
    pub topic_id: TopicId,
    pub label: String,
    pub size: usize,
    pub client_count: usize,
    pub competitor_count: usize,
    /// Members whose population could not be resolved from the corpus.
    pub unknown_count: usize,
    pub temporal_metrics: Vec<TemporalMetric>,
}

impl OwnershipPartition {
    /// Share of the topic published by competitors, over members with a known owner.
    pub fn competitor_share(&self) -> Option<f64> {
        let known = self.client_count + self.competitor_count;
        (known > 0).then(|| self.competitor_count as f64 / known as f64)
    }
}

fn metrics_by_cluster(metrics: &[TemporalMetric]) -> HashMap<TopicId, Vec<TemporalMetric>> {
    let mut grouped: HashMap<TopicId, Vec<TemporalMetric>> = HashMap::new();
    for metric in metrics {
        grouped.entry(metric.cluster_id).or_default().push(metric.clone());
    }
    for list in grouped.values_mut() {
        list.sort_by_key(|m| m.window_days);
    }
    grouped
}

pub fn cluster_summaries(clusters: &[Cluster], metrics: &[TemporalMetric]) -> Vec<ClusterSummary> {
    let mut grouped = metrics_by_cluster(metrics);
    clusters
        .iter()
        .map(|c| ClusterSummary {
            topic_id: c.id,
            label: c.label.clone(),
            top_terms: c.top_terms.clone(),
            size: c.size,
            coherence: c.coherence,
            excerpts: c.representative_docs.clone(),
            temporal_metrics: grouped.remove(&c.id).unwrap_or_default(),
        })
        .collect()
}

pub fn partition_by_ownership(
    clusters: &[Cluster],
    metrics: &[TemporalMetric],
    corpus: &FetchedCorpus,
) -> Vec<OwnershipPartition> {
    let owner_of: HashMap<&str, Owner> = corpus
        .document_ids
        .iter()
        .map(String::as_str)
        .zip(corpus.owners.iter().copied())
        .collect();
    let mut grouped = metrics_by_cluster(metrics);

    clusters
        .iter()
        .map(|c| {
            let (mut client_count, mut competitor_count, mut unknown_count) = (0, 0, 0);
            for id in &c.member_ids {
                match owner_of.get(id.as_str()) {
                    Some(Owner::Client) => client_count += 1,
                    Some(Owner::Competitor) => competitor_count += 1,
                    None => unknown_count += 1,
                }
            }
            OwnershipPartition {
                topic_id: c.id,
                label: c.label.clone(),
                size: c.size,
                client_count,
                competitor_count,
                unknown_count,
                temporal_metrics: grouped.remove(&c.id).unwrap_or_default(),
            }
        })
        .collect()
}

/// JSON Schema of the enrichment payload, for collaborators that validate input.
pub fn cluster_summary_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Vec<ClusterSummary>)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use themewatch_common::DocumentMetadata;

    fn cluster(id: TopicId, member_ids: &[&str]) -> Cluster {
        Cluster {
            id,
            label: format!("label_{id}"),
            top_terms: vec![TopTerm { term: "solar".into(), weight: 0.4 }],
            size: member_ids.len(),
            centroid: vec![1.0, 0.0],
            coherence: Some(0.8),
            representative_docs: vec!["excerpt".into()],
            members: Vec::new(),
            member_ids: member_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn metric(cluster_id: TopicId, window_days: u32) -> TemporalMetric {
        TemporalMetric {
            cluster_id,
            window_days,
            window_start: Utc::now(),
            window_end: Utc::now(),
            volume: 1,
            velocity: 0.0,
            freshness_ratio: 0.5,
            source_diversity: 1,
            cohesion_score: None,
            potential_score: 0.2,
            drift_detected: false,
            drift_distance: None,
        }
    }

    #[test]
    fn summaries_group_metrics_by_cluster_in_window_order() {
        let clusters = vec![cluster(0, &["a"]), cluster(1, &["b"])];
        let metrics = vec![metric(1, 30), metric(0, 7), metric(1, 7)];

        let summaries = cluster_summaries(&clusters, &metrics);

        assert_eq!(summaries[0].temporal_metrics.len(), 1);
        let windows: Vec<u32> = summaries[1].temporal_metrics.iter().map(|m| m.window_days).collect();
        assert_eq!(windows, vec![7, 30]);
        assert_eq!(summaries[0].excerpts, vec!["excerpt"]);
    }

    #[test]
    fn partition_counts_members_per_population() {
        let corpus = FetchedCorpus {
            document_ids: vec!["a".into(), "b".into(), "c".into()],
            owners: vec![Owner::Client, Owner::Competitor, Owner::Competitor],
            texts: vec![String::new(); 3],
            embeddings: vec![vec![1.0]; 3],
            metadata: vec![DocumentMetadata::default(); 3],
        };
        let clusters = vec![cluster(0, &["a", "b", "c", "gone"])];

        let partitions = partition_by_ownership(&clusters, &[], &corpus);

        assert_eq!(partitions[0].client_count, 1);
        assert_eq!(partitions[0].competitor_count, 2);
        assert_eq!(partitions[0].unknown_count, 1);
        assert!((partitions[0].competitor_share().unwrap() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn schema_describes_summary_fields() {
        let schema = cluster_summary_schema().to_string();
        assert!(schema.contains("top_terms"));
        assert!(schema.contains("temporal_metrics"));
    }
}
