//! Outlier handler: triage of documents the clusterer left unclustered.
//!
//! Categories are assigned by a fixed decision tree, checked in order:
//!
//! 1. `too_short`     word count below `min_word_count` (distance is not consulted)
//! 2. `too_unique`    nearest-centroid distance above `high_distance`
//! 3. `mixed_topics`  nearest-centroid distance below `low_distance`
//! 4. `emerging`      any other distance
//! 5. `uncategorized` no distance (no centroids to compare against)
//!
//! Sub-groups among outliers are surfaced as potential topics and never merged
//! into the run's topic set.

use std::collections::BTreeMap;

use tracing::info;

use themewatch_common::{
    word_count, Cluster, DistanceMetric, Outlier, OutlierCategory, OutlierConfig, OutlierSummary,
    PotentialTopic, ThemeWatchError, TopicId, SENTINEL_TOPIC,
};

use crate::hdbscan::Hdbscan;
use crate::similarity::{centroid, cosine_distance};
use crate::terms::class_tfidf;

const POTENTIAL_TOP_TERMS: usize = 10;

pub struct OutlierHandler {
    config: OutlierConfig,
}

/// Everything the handler derives for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierReport {
    pub outliers: Vec<Outlier>,
    pub potential_topics: Vec<PotentialTopic>,
    pub summary: OutlierSummary,
}

impl OutlierHandler {
    pub fn new(config: OutlierConfig) -> Self {
        Self { config }
    }

    /// One record per sentinel-labeled document, in input order, capped at
    /// `max_outliers`. Records start `uncategorized`; see `categorize_outliers`.
    pub fn extract_outliers(
        &self,
        labels: &[TopicId],
        document_ids: &[String],
        texts: &[String],
        embeddings: &[Vec<f32>],
        clusters: &[Cluster],
    ) -> Vec<Outlier> {
        let total = labels.iter().filter(|l| **l == SENTINEL_TOPIC).count();
        let outliers: Vec<Outlier> = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| **label == SENTINEL_TOPIC)
            .take(self.config.max_outliers)
            .map(|(index, _)| {
                let nearest = embeddings
                    .get(index)
                    .and_then(|e| nearest_cluster(e, clusters));
                Outlier {
                    index,
                    document_id: document_ids.get(index).cloned().unwrap_or_default(),
                    word_count: texts.get(index).map(|t| word_count(t)).unwrap_or(0),
                    nearest_cluster: nearest.map(|(id, _)| id),
                    distance: nearest.map(|(_, d)| d),
                    category: OutlierCategory::Uncategorized,
                }
            })
            .collect();

        if total > outliers.len() {
            info!(
                total,
                kept = outliers.len(),
                max_outliers = self.config.max_outliers,
                "Outlier list capped"
            );
        }
        outliers
    }

    pub fn categorize(&self, word_count: usize, distance: Option<f64>) -> OutlierCategory {
        if word_count < self.config.min_word_count {
            return OutlierCategory::TooShort;
        }
        match distance {
            Some(d) if d > self.config.high_distance => OutlierCategory::TooUnique,
            Some(d) if d < self.config.low_distance => OutlierCategory::MixedTopics,
            Some(_) => OutlierCategory::Emerging,
            None => OutlierCategory::Uncategorized,
        }
    }

    pub fn categorize_outliers(&self, outliers: &mut [Outlier]) {
        for outlier in outliers.iter_mut() {
            outlier.category = self.categorize(outlier.word_count, outlier.distance);
        }
    }

    /// Looser second HDBSCAN pass over the outliers alone, on their embeddings
    /// with cosine distance. Each group reaching `potential_min_cluster_size`
    /// becomes `potential_topic_<n>` with its own centroid and top terms.
    pub fn find_potential_clusters(
        &self,
        outliers: &[Outlier],
        texts: &[String],
        embeddings: &[Vec<f32>],
    ) -> Result<Vec<PotentialTopic>, ThemeWatchError> {
        let indices: Vec<usize> = outliers
            .iter()
            .map(|o| o.index)
            .filter(|i| *i < embeddings.len())
            .collect();
        if indices.len() < self.config.potential_min_cluster_size {
            return Ok(Vec::new());
        }

        let subset: Vec<Vec<f32>> = indices.iter().map(|&i| embeddings[i].clone()).collect();
        let labels = Hdbscan {
            min_cluster_size: self.config.potential_min_cluster_size,
            min_samples: self.config.potential_min_samples,
            metric: DistanceMetric::Cosine,
        }
        .fit(&subset)?;

        let mut groups: BTreeMap<TopicId, Vec<usize>> = BTreeMap::new();
        for (pos, label) in labels.iter().enumerate() {
            if *label != SENTINEL_TOPIC {
                groups.entry(*label).or_default().push(indices[pos]);
            }
        }

        let classes: Vec<Vec<usize>> = groups.values().cloned().collect();
        let terms = class_tfidf(texts, &classes, POTENTIAL_TOP_TERMS);
        let by_index: BTreeMap<usize, &Outlier> = outliers.iter().map(|o| (o.index, o)).collect();

        let potential: Vec<PotentialTopic> = groups
            .into_iter()
            .zip(terms)
            .map(|((label, members), top_terms)| PotentialTopic {
                name: format!("potential_topic_{label}"),
                size: members.len(),
                document_ids: members
                    .iter()
                    .filter_map(|i| by_index.get(i).map(|o| o.document_id.clone()))
                    .collect(),
                centroid: centroid(embeddings, &members),
                top_terms,
            })
            .collect();

        info!(
            outliers = indices.len(),
            potential_topics = potential.len(),
            "Outlier sub-clustering complete"
        );
        Ok(potential)
    }

    pub fn summarize(&self, outliers: &[Outlier], potential_topics: &[PotentialTopic]) -> OutlierSummary {
        let mut by_category = BTreeMap::new();
        for outlier in outliers {
            *by_category.entry(outlier.category).or_insert(0) += 1;
        }
        OutlierSummary {
            total: outliers.len(),
            by_category,
            potential_topics: potential_topics.len(),
        }
    }

    /// Extract, categorize, sub-cluster and summarize.
    pub fn handle(
        &self,
        labels: &[TopicId],
        document_ids: &[String],
        texts: &[String],
        embeddings: &[Vec<f32>],
        clusters: &[Cluster],
    ) -> Result<OutlierReport, ThemeWatchError> {
        let mut outliers = self.extract_outliers(labels, document_ids, texts, embeddings, clusters);
        self.categorize_outliers(&mut outliers);
        let potential_topics = self.find_potential_clusters(&outliers, texts, embeddings)?;
        let summary = self.summarize(&outliers, &potential_topics);
        info!(
            outliers = summary.total,
            too_short = summary.by_category.get(&OutlierCategory::TooShort).copied().unwrap_or(0),
            emerging = summary.by_category.get(&OutlierCategory::Emerging).copied().unwrap_or(0),
            potential_topics = summary.potential_topics,
            "Outliers triaged"
        );
        Ok(OutlierReport {
            outliers,
            potential_topics,
            summary,
        })
    }
}

/// Closest centroid by cosine distance, ties to the lowest cluster id.
fn nearest_cluster(embedding: &[f32], clusters: &[Cluster]) -> Option<(TopicId, f64)> {
    clusters
        .iter()
        .filter(|c| !c.centroid.is_empty())
        .map(|c| (c.id, cosine_distance(embedding, &c.centroid)))
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> OutlierHandler {
        OutlierHandler::new(OutlierConfig::default())
    }

    fn cluster(id: TopicId, centroid: Vec<f32>, size: usize) -> Cluster {
        Cluster {
            id,
            label: format!("topic_{id}"),
            top_terms: Vec::new(),
            size,
            centroid,
            coherence: None,
            representative_docs: Vec::new(),
            members: Vec::new(),
            member_ids: Vec::new(),
        }
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn decision_tree_priority_order() {
        let h = handler();
        // Short text wins over every distance band.
        assert_eq!(h.categorize(10, Some(0.9)), OutlierCategory::TooShort);
        assert_eq!(h.categorize(10, Some(0.45)), OutlierCategory::TooShort);
        assert_eq!(h.categorize(10, Some(0.1)), OutlierCategory::TooShort);
        assert_eq!(h.categorize(10, None), OutlierCategory::TooShort);

        assert_eq!(h.categorize(80, Some(0.9)), OutlierCategory::TooUnique);
        assert_eq!(h.categorize(80, Some(0.1)), OutlierCategory::MixedTopics);
        assert_eq!(h.categorize(80, Some(0.45)), OutlierCategory::Emerging);
        assert_eq!(h.categorize(80, None), OutlierCategory::Uncategorized);
    }

    #[test]
    fn threshold_boundaries_are_emerging() {
        let h = handler();
        assert_eq!(h.categorize(50, Some(0.6)), OutlierCategory::Emerging);
        assert_eq!(h.categorize(50, Some(0.3)), OutlierCategory::Emerging);
        assert_eq!(h.categorize(49, Some(0.45)), OutlierCategory::TooShort);
    }

    /// Clusters {A: 30, B: 25} plus 12 unclustered documents.
    #[test]
    fn extracts_every_unclustered_document() {
        let mut labels = vec![0; 30];
        labels.extend(vec![1; 25]);
        labels.extend(vec![SENTINEL_TOPIC; 12]);
        let n = labels.len();

        let ids: Vec<String> = (0..n).map(|i| format!("doc-{i}")).collect();
        let mut texts: Vec<String> = (0..n).map(|_| words(80)).collect();
        let mut embeddings: Vec<Vec<f32>> = (0..n).map(|_| vec![1.0, 0.0]).collect();

        // A mid-distance document (would be emerging) that is too short.
        texts[55] = words(5);
        embeddings[55] = vec![0.55, -0.835];
        embeddings[56] = vec![0.55, -0.835];

        let clusters = vec![cluster(0, vec![1.0, 0.0], 30), cluster(1, vec![0.0, 1.0], 25)];
        let h = handler();
        let mut outliers = h.extract_outliers(&labels, &ids, &texts, &embeddings, &clusters);
        h.categorize_outliers(&mut outliers);

        assert_eq!(outliers.len(), 12);
        assert_eq!(outliers[0].index, 55);
        assert_eq!(outliers[0].document_id, "doc-55");
        let d = outliers[0].distance.unwrap();
        assert!(d > 0.3 && d < 0.6);
        assert_eq!(outliers[0].category, OutlierCategory::TooShort);
        assert_eq!(outliers[1].category, OutlierCategory::Emerging);
    }

    #[test]
    fn cap_keeps_lowest_indices() {
        let labels = vec![SENTINEL_TOPIC; 10];
        let ids: Vec<String> = (0..10).map(|i| format!("d{i}")).collect();
        let texts = vec![String::new(); 10];
        let h = OutlierHandler::new(OutlierConfig {
            max_outliers: 4,
            ..OutlierConfig::default()
        });
        let outliers = h.extract_outliers(&labels, &ids, &texts, &[], &[]);
        assert_eq!(outliers.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(outliers.iter().all(|o| o.distance.is_none()));
    }

    #[test]
    fn nearest_centroid_ties_go_to_lowest_id() {
        let clusters = vec![cluster(3, vec![0.0, 1.0], 5), cluster(1, vec![1.0, 0.0], 5)];
        let (id, d) = nearest_cluster(&[1.0, 1.0], &clusters).unwrap();
        assert_eq!(id, 1);
        assert!((d - (1.0 - std::f64::consts::FRAC_1_SQRT_2)).abs() < 1e-6);
    }

    #[test]
    fn potential_topics_found_among_outliers() {
        let mut embeddings = Vec::new();
        let mut texts = Vec::new();
        for i in 0..4 {
            embeddings.push(vec![1.0, 0.01 * i as f32, 0.0]);
            texts.push("drone delivery regulation".to_string());
        }
        for i in 0..4 {
            embeddings.push(vec![0.0, 0.01 * i as f32, 1.0]);
            texts.push("sourdough starter hydration".to_string());
        }
        let labels = vec![SENTINEL_TOPIC; 8];
        let ids: Vec<String> = (0..8).map(|i| format!("o{i}")).collect();

        let h = handler();
        let report = h.handle(&labels, &ids, &texts, &embeddings, &[]).unwrap();

        assert_eq!(report.potential_topics.len(), 2);
        assert_eq!(report.potential_topics[0].name, "potential_topic_0");
        assert_eq!(report.potential_topics[0].document_ids, vec!["o0", "o1", "o2", "o3"]);
        assert!(report.potential_topics[1].top_terms.iter().any(|t| t.term == "sourdough"));
        assert_eq!(report.summary.total, 8);
        assert_eq!(report.summary.potential_topics, 2);
        assert_eq!(report.summary.by_category.get(&OutlierCategory::TooShort), Some(&8));
    }

    #[test]
    fn too_few_outliers_for_sub_clustering() {
        let outliers = vec![];
        assert!(handler().find_potential_clusters(&outliers, &[], &[]).unwrap().is_empty());
    }
}
