use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Topic ids ---

/// Topic (cluster) identifier, scoped to one analysis run.
pub type TopicId = i64;

/// Reserved topic meaning "not assigned to any cluster". Never persisted as an assignment.
pub const SENTINEL_TOPIC: TopicId = -1;

pub fn is_sentinel(topic: TopicId) -> bool {
    topic == SENTINEL_TOPIC
}

// --- Ownership ---

/// The population a document belongs to. Each population has its own vector
/// collection and its own relational table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Client,
    Competitor,
}

impl Owner {
    pub const ALL: [Owner; 2] = [Owner::Client, Owner::Competitor];

    /// Vector collection holding this population's embeddings.
    pub fn collection(&self) -> &'static str {
        match self {
            Owner::Client => "client_articles",
            Owner::Competitor => "competitor_articles",
        }
    }

    /// Relational table holding this population's article rows.
    pub fn table(&self) -> &'static str {
        match self {
            Owner::Client => "client_articles",
            Owner::Competitor => "competitor_articles",
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Client => write!(f, "client"),
            Owner::Competitor => write!(f, "competitor"),
        }
    }
}

// --- Documents ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DocumentMetadata {
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_domain: Option<String>,
}

/// An embedded article. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner: Owner,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn word_count(&self) -> usize {
        word_count(&self.text)
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// --- Clusters ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TopTerm {
    pub term: String,
    pub weight: f64,
}

/// A discovered topic. Built once per run and not mutated after labeling.
///
/// `members` are indices into the run's corpus arrays; `member_ids` carries the
/// same members as document ids so the cluster survives persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: TopicId,
    pub label: String,
    pub top_terms: Vec<TopTerm>,
    pub size: usize,
    pub centroid: Vec<f32>,
    pub coherence: Option<f64>,
    pub representative_docs: Vec<String>,
    pub members: Vec<usize>,
    pub member_ids: Vec<String>,
}

// --- Outliers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutlierCategory {
    TooShort,
    TooUnique,
    MixedTopics,
    Emerging,
    Uncategorized,
}

impl std::fmt::Display for OutlierCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutlierCategory::TooShort => write!(f, "too_short"),
            OutlierCategory::TooUnique => write!(f, "too_unique"),
            OutlierCategory::MixedTopics => write!(f, "mixed_topics"),
            OutlierCategory::Emerging => write!(f, "emerging"),
            OutlierCategory::Uncategorized => write!(f, "uncategorized"),
        }
    }
}

/// A document the clusterer left on the sentinel topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub index: usize,
    pub document_id: String,
    pub word_count: usize,
    pub nearest_cluster: Option<TopicId>,
    pub distance: Option<f64>,
    pub category: OutlierCategory,
}

/// A sub-group found among outliers. Surfaced for review, never promoted automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PotentialTopic {
    pub name: String,
    pub size: usize,
    pub document_ids: Vec<String>,
    pub centroid: Vec<f32>,
    pub top_terms: Vec<TopTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutlierSummary {
    pub total: usize,
    pub by_category: BTreeMap<OutlierCategory, usize>,
    pub potential_topics: usize,
}

// --- Assignments ---

/// `document_id -> topic_id` for one run. Never contains the sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicAssignment {
    pub run_id: Uuid,
    mapping: BTreeMap<String, TopicId>,
}

impl TopicAssignment {
    /// Build from parallel topic/document arrays, dropping sentinel entries.
    pub fn from_parallel(run_id: Uuid, topics: &[TopicId], document_ids: &[String]) -> Self {
        let mapping = topics
            .iter()
            .zip(document_ids.iter())
            .filter(|(topic, _)| !is_sentinel(**topic))
            .map(|(topic, id)| (id.clone(), *topic))
            .collect();
        Self { run_id, mapping }
    }

    pub fn get(&self, document_id: &str) -> Option<TopicId> {
        self.mapping.get(document_id).copied()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Entries in document-id order.
    pub fn entries(&self) -> Vec<(String, TopicId)> {
        self.mapping.iter().map(|(id, topic)| (id.clone(), *topic)).collect()
    }
}

// --- Temporal metrics ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemporalMetric {
    pub cluster_id: TopicId,
    pub window_days: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub volume: u32,
    pub velocity: f64,
    pub freshness_ratio: f64,
    pub source_diversity: u32,
    pub cohesion_score: Option<f64>,
    pub potential_score: f64,
    pub drift_detected: bool,
    pub drift_distance: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_drops_sentinel_entries() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let topics = [0, SENTINEL_TOPIC, 1, SENTINEL_TOPIC];
        let assignment = TopicAssignment::from_parallel(Uuid::new_v4(), &topics, &ids);

        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment.get("a"), Some(0));
        assert_eq!(assignment.get("b"), None);
        assert!(assignment.entries().iter().all(|(_, t)| *t != SENTINEL_TOPIC));
    }

    #[test]
    fn owner_maps_to_distinct_collections() {
        assert_ne!(Owner::Client.collection(), Owner::Competitor.collection());
        assert_eq!(Owner::Competitor.to_string(), "competitor");
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(word_count("  one two\tthree\nfour "), 4);
        assert_eq!(word_count(""), 0);
    }
}
