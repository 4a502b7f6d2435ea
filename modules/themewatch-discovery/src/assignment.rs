//! Topic assignment: write one run's `document -> topic` mapping into both the
//! vector index payloads and the relational article tables.
//!
//! The two stores are written independently and concurrently, and their counts
//! are reported independently. Neither path aborts on a per-document or
//! per-batch failure; failures are collected into the report.
//!
//! Vector side: a document's population is not known here, so each candidate
//! collection is tried in order and every attempt becomes a `LookupOutcome`.
//! "Not in this collection" moves on to the next candidate; a document is an
//! error only when no candidate holds it.
//!
//! Relational side: entries are chunked into batches and each batch is applied
//! to every population table in its own transaction, so a failed batch never
//! rolls back earlier ones.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use themewatch_common::{AssignmentConfig, Owner, ThemeWatchError, TopicAssignment, TopicId};
use themewatch_store::{ArticleStore, StoreError, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PropagationTarget {
    VectorStore,
    RelationalStore,
}

/// One propagation failure: a document for the vector store, a batch for the
/// relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssignmentError {
    pub target: PropagationTarget,
    pub document_id: Option<String>,
    pub batch: Option<usize>,
    pub message: String,
}

/// Result of one payload update attempt against one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found,
    NotFound,
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssignmentReport {
    pub assigned_in_vector_store: usize,
    pub assigned_in_relational_store: usize,
    pub errors: Vec<AssignmentError>,
}

impl AssignmentReport {
    /// The stores may now disagree about some documents.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty() || self.assigned_in_vector_store != self.assigned_in_relational_store
    }

    /// `PartialPropagation` when the report is partial.
    pub fn to_error(&self) -> Option<ThemeWatchError> {
        self.is_partial().then(|| ThemeWatchError::PartialPropagation {
            vector: self.assigned_in_vector_store,
            relational: self.assigned_in_relational_store,
            errors: self.errors.len(),
        })
    }
}

pub struct TopicAssignmentService {
    vectors: Arc<dyn VectorIndex>,
    articles: Arc<dyn ArticleStore>,
    config: AssignmentConfig,
    populations: Vec<Owner>,
}

impl TopicAssignmentService {
    pub fn new(
        vectors: Arc<dyn VectorIndex>,
        articles: Arc<dyn ArticleStore>,
        config: AssignmentConfig,
    ) -> Self {
        Self {
            vectors,
            articles,
            config,
            populations: Owner::ALL.to_vec(),
        }
    }

    /// Build the mapping from parallel arrays (sentinel entries dropped) and
    /// propagate it to both stores. Re-applying the same mapping is idempotent.
    pub async fn assign_topics_after_clustering(
        &self,
        run_id: Uuid,
        topics: &[TopicId],
        document_ids: &[String],
        scope: &str,
    ) -> Result<AssignmentReport, ThemeWatchError> {
        if topics.len() != document_ids.len() {
            return Err(ThemeWatchError::Validation(format!(
                "{} topics for {} documents",
                topics.len(),
                document_ids.len()
            )));
        }
        let assignment = TopicAssignment::from_parallel(run_id, topics, document_ids);
        info!(
            scope,
            %run_id,
            documents = document_ids.len(),
            assigned = assignment.len(),
            "Propagating topic assignments"
        );

        let (vector, relational) = tokio::join!(
            self.propagate_to_vector_store(&assignment),
            self.propagate_to_relational_store(&assignment),
        );
        let (assigned_in_vector_store, mut errors) = vector;
        let (assigned_in_relational_store, relational_errors) = relational;
        errors.extend(relational_errors);

        let report = AssignmentReport {
            assigned_in_vector_store,
            assigned_in_relational_store,
            errors,
        };
        if report.is_partial() {
            warn!(
                scope,
                vector = report.assigned_in_vector_store,
                relational = report.assigned_in_relational_store,
                errors = report.errors.len(),
                "Topic propagation diverged between stores"
            );
        } else {
            info!(
                scope,
                assigned = report.assigned_in_vector_store,
                "Topic propagation complete"
            );
        }
        Ok(report)
    }

    async fn propagate_to_vector_store(
        &self,
        assignment: &TopicAssignment,
    ) -> (usize, Vec<AssignmentError>) {
        let mut candidates = Vec::new();
        let mut unreachable = Vec::new();
        for owner in &self.populations {
            let collection = owner.collection();
            match self.with_retry(|| self.vectors.collection_exists(collection)).await {
                Ok(true) => candidates.push(collection),
                Ok(false) => warn!(collection, "Vector collection missing, skipping as candidate"),
                Err(e) => {
                    warn!(collection, error = %e, "Vector collection unreachable, skipping as candidate");
                    unreachable.push(format!("{collection}: {e}"));
                }
            }
        }

        let run_id = assignment.run_id;
        let candidates = &candidates;
        let results: Vec<(String, Vec<LookupOutcome>)> = stream::iter(assignment.entries())
            .map(|(id, topic)| async move {
                let outcomes = self.lookup_and_update(candidates, &id, topic, run_id).await;
                (id, outcomes)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut assigned = 0usize;
        let mut errors = Vec::new();
        for (id, outcomes) in results {
            if outcomes.contains(&LookupOutcome::Found) {
                assigned += 1;
                continue;
            }
            let failures: Vec<&str> = outcomes
                .iter()
                .filter_map(|o| match o {
                    LookupOutcome::Error(msg) => Some(msg.as_str()),
                    _ => None,
                })
                .collect();
            let message = if !failures.is_empty() {
                format!("vector update failed: {}", failures.join("; "))
            } else if !unreachable.is_empty() {
                format!("collection unreachable: {}", unreachable.join("; "))
            } else {
                "document not found in any vector collection".to_string()
            };
            warn!(document_id = id.as_str(), message = message.as_str(), "Vector assignment failed");
            errors.push(AssignmentError {
                target: PropagationTarget::VectorStore,
                document_id: Some(id),
                batch: None,
                message,
            });
        }
        errors.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        (assigned, errors)
    }

    /// Try each candidate collection in order, stopping at the first that holds
    /// the document.
    async fn lookup_and_update(
        &self,
        candidates: &[&str],
        id: &str,
        topic: TopicId,
        run_id: Uuid,
    ) -> Vec<LookupOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for collection in candidates {
            let patch = json!({ "topic_id": topic, "topic_run_id": run_id });
            let outcome = match self
                .with_retry(|| self.vectors.set_payload(collection, id, patch.clone()))
                .await
            {
                Ok(true) => LookupOutcome::Found,
                Ok(false) => LookupOutcome::NotFound,
                Err(e) => LookupOutcome::Error(format!("{collection}: {e}")),
            };
            debug!(collection = *collection, document_id = id, outcome = ?outcome, "Vector lookup");
            let found = outcome == LookupOutcome::Found;
            outcomes.push(outcome);
            if found {
                break;
            }
        }
        outcomes
    }

    async fn propagate_to_relational_store(
        &self,
        assignment: &TopicAssignment,
    ) -> (usize, Vec<AssignmentError>) {
        let entries = assignment.entries();
        let mut updated = 0u64;
        let mut errors = Vec::new();

        for (batch_index, batch) in entries.chunks(self.config.batch_size).enumerate() {
            for owner in &self.populations {
                let result = self
                    .with_retry(|| self.articles.update_topics(*owner, assignment.run_id, batch))
                    .await;
                match result {
                    Ok(rows) => updated += rows,
                    Err(e) => {
                        warn!(batch = batch_index, table = owner.table(), error = %e, "Relational batch failed");
                        errors.push(AssignmentError {
                            target: PropagationTarget::RelationalStore,
                            document_id: None,
                            batch: Some(batch_index),
                            message: format!("{}: {e}", owner.table()),
                        });
                    }
                }
            }
        }
        (updated as usize, errors)
    }

    /// Retry transient store failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.config.base_backoff_ms.saturating_mul(1 << (attempt - 1).min(16));
                    debug!(attempt, delay_ms = delay, error = %e, "Transient store error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themewatch_common::SENTINEL_TOPIC;
    use themewatch_store::memory::{InMemoryArticleStore, InMemoryVectorIndex};
    use themewatch_store::VectorPoint;

    fn fast_config() -> AssignmentConfig {
        AssignmentConfig {
            batch_size: 10,
            concurrency: 4,
            max_attempts: 3,
            base_backoff_ms: 1,
        }
    }

    fn stores() -> (Arc<InMemoryVectorIndex>, Arc<InMemoryArticleStore>) {
        let vectors = InMemoryVectorIndex::new()
            .with_collection(Owner::Client.collection())
            .with_collection(Owner::Competitor.collection());
        (Arc::new(vectors), Arc::new(InMemoryArticleStore::new()))
    }

    fn add(vectors: &InMemoryVectorIndex, articles: &InMemoryArticleStore, owner: Owner, id: &str) {
        vectors.insert(
            owner.collection(),
            VectorPoint {
                id: id.to_string(),
                embedding: vec![1.0],
                payload: json!({}),
            },
        );
        articles.insert_article(owner, id);
    }

    fn service(vectors: &Arc<InMemoryVectorIndex>, articles: &Arc<InMemoryArticleStore>) -> TopicAssignmentService {
        TopicAssignmentService::new(vectors.clone(), articles.clone(), fast_config())
    }

    #[tokio::test]
    async fn missing_vector_points_are_errors_and_counts_stay_independent() {
        let (vectors, articles) = stores();
        let ids: Vec<String> = (0..150).map(|i| format!("doc-{i:03}")).collect();
        for (i, id) in ids.iter().enumerate() {
            let owner = if i % 2 == 0 { Owner::Client } else { Owner::Competitor };
            articles.insert_article(owner, id);
            // The last ten documents never reached the vector index.
            if i < 140 {
                vectors.insert(
                    owner.collection(),
                    VectorPoint {
                        id: id.clone(),
                        embedding: vec![1.0],
                        payload: json!({}),
                    },
                );
            }
        }
        let topics: Vec<TopicId> = (0..150).map(|i| (i % 3) as TopicId).collect();

        let report = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &topics, &ids, "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 140);
        assert_eq!(report.errors.len(), 10);
        assert!(report.errors.iter().all(|e| e.target == PropagationTarget::VectorStore));
        assert_eq!(report.assigned_in_relational_store, 150);
        assert!(report.is_partial());
        assert_eq!(vectors.payload(Owner::Competitor.collection(), "doc-001").unwrap()["topic_id"], 1);
    }

    #[tokio::test]
    async fn sentinel_is_never_written() {
        let (vectors, articles) = stores();
        add(&vectors, &articles, Owner::Client, "a");
        add(&vectors, &articles, Owner::Client, "b");
        let ids = vec!["a".to_string(), "b".to_string()];

        let report = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &[4, SENTINEL_TOPIC], &ids, "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 1);
        assert_eq!(report.assigned_in_relational_store, 1);
        assert!(vectors.payload(Owner::Client.collection(), "b").unwrap().get("topic_id").is_none());
        assert_eq!(articles.topic_of(Owner::Client, "b").await.unwrap(), None);
        assert!(!report.is_partial());
    }

    #[tokio::test]
    async fn reapplying_the_same_mapping_is_idempotent() {
        let (vectors, articles) = stores();
        let ids: Vec<String> = (0..12).map(|i| format!("d{i}")).collect();
        for (i, id) in ids.iter().enumerate() {
            let owner = if i < 6 { Owner::Client } else { Owner::Competitor };
            add(&vectors, &articles, owner, id);
        }
        let topics: Vec<TopicId> = (0..12).map(|i| (i % 2) as TopicId).collect();
        let svc = service(&vectors, &articles);

        let first = svc.assign_topics_after_clustering(Uuid::new_v4(), &topics, &ids, "acme").await.unwrap();
        let second = svc.assign_topics_after_clustering(Uuid::new_v4(), &topics, &ids, "acme").await.unwrap();

        assert_eq!(first.assigned_in_vector_store, second.assigned_in_vector_store);
        assert_eq!(first.assigned_in_relational_store, second.assigned_in_relational_store);
        for (i, id) in ids.iter().enumerate() {
            let owner = if i < 6 { Owner::Client } else { Owner::Competitor };
            assert_eq!(articles.topic_of(owner, id).await.unwrap(), Some((i % 2) as TopicId));
            assert_eq!(vectors.payload(owner.collection(), id).unwrap()["topic_id"], (i % 2) as i64);
        }
    }

    #[tokio::test]
    async fn failed_batch_does_not_roll_back_other_batches() {
        let (vectors, articles) = stores();
        let ids: Vec<String> = (0..25).map(|i| format!("d{i:02}")).collect();
        for id in &ids {
            add(&vectors, &articles, Owner::Client, id);
        }
        // d12 sits in the second batch of ten.
        articles.poison("d12");
        let topics = vec![0; 25];

        let report = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &topics, &ids, "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 25);
        assert_eq!(report.assigned_in_relational_store, 15);
        let relational: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.target == PropagationTarget::RelationalStore)
            .collect();
        assert_eq!(relational.len(), 1);
        assert_eq!(relational[0].batch, Some(1));
        assert_eq!(articles.topic_of(Owner::Client, "d00").await.unwrap(), Some(0));
        assert_eq!(articles.topic_of(Owner::Client, "d24").await.unwrap(), Some(0));
        assert_eq!(articles.topic_of(Owner::Client, "d12").await.unwrap(), None);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (vectors, articles) = stores();
        add(&vectors, &articles, Owner::Competitor, "x");
        vectors.flaky_point(Owner::Client.collection(), "x", 2);
        articles.fail_next_batches(2);

        let report = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &[9], &["x".to_string()], "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 1);
        assert_eq!(report.assigned_in_relational_store, 1);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn unreachable_candidate_is_not_fatal_when_another_holds_the_document() {
        let (vectors, articles) = stores();
        add(&vectors, &articles, Owner::Competitor, "x");
        vectors.break_point(Owner::Client.collection(), "x");

        let report = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &[1], &["x".to_string()], "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 1);
        assert!(report.errors.is_empty());
    }

    /// A vector index that rejects every request.
    struct DownVectorIndex;

    #[async_trait::async_trait]
    impl VectorIndex for DownVectorIndex {
        async fn collection_exists(&self, _collection: &str) -> Result<bool, StoreError> {
            Err(StoreError::Query("vector index rejected request".into()))
        }
        async fn scroll(&self, _collection: &str) -> Result<Vec<VectorPoint>, StoreError> {
            Err(StoreError::Query("vector index rejected request".into()))
        }
        async fn point_exists(&self, _collection: &str, _id: &str) -> Result<bool, StoreError> {
            Err(StoreError::Query("vector index rejected request".into()))
        }
        async fn set_payload(
            &self,
            _collection: &str,
            _id: &str,
            _patch: serde_json::Value,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Query("vector index rejected request".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_vector_store_still_reports_relational_writes() {
        let articles = Arc::new(InMemoryArticleStore::new());
        let ids: Vec<String> = (0..5).map(|i| format!("d{i}")).collect();
        for id in &ids {
            articles.insert_article(Owner::Client, id);
        }
        let svc = TopicAssignmentService::new(Arc::new(DownVectorIndex), articles.clone(), fast_config());

        let report = svc
            .assign_topics_after_clustering(Uuid::new_v4(), &[0, 0, 1, 1, 2], &ids, "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 0);
        assert_eq!(report.assigned_in_relational_store, 5);
        assert_eq!(report.errors.len(), 5);
        assert!(report.errors.iter().all(|e| e.target == PropagationTarget::VectorStore
            && e.message.starts_with("collection unreachable")));
        assert!(report.is_partial());
        assert_eq!(articles.topic_of(Owner::Client, "d0").await.unwrap(), Some(0));
        assert_eq!(articles.topic_of(Owner::Client, "d4").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn failing_relational_store_leaves_vector_count_intact() {
        let (vectors, articles) = stores();
        let ids: Vec<String> = (0..8).map(|i| format!("d{i}")).collect();
        for id in &ids {
            add(&vectors, &articles, Owner::Competitor, id);
            articles.poison(id);
        }

        let report = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &[3; 8], &ids, "acme")
            .await
            .unwrap();

        assert_eq!(report.assigned_in_vector_store, 8);
        assert_eq!(report.assigned_in_relational_store, 0);
        assert!(!report.errors.is_empty());
        assert!(report.errors.iter().all(|e| e.target == PropagationTarget::RelationalStore));
        assert_eq!(vectors.payload(Owner::Competitor.collection(), "d7").unwrap()["topic_id"], 3);
    }

    #[tokio::test]
    async fn mismatched_arrays_are_rejected() {
        let (vectors, articles) = stores();
        let result = service(&vectors, &articles)
            .assign_topics_after_clustering(Uuid::new_v4(), &[1, 2], &["a".to_string()], "acme")
            .await;
        assert!(matches!(result, Err(ThemeWatchError::Validation(_))));
    }
}
