// Trait seams between the discovery pipeline and its stores.
//
// VectorIndex - embeddings and per-point payload, one collection per population.
// ArticleStore - relational article rows for both populations, keyed by document id.
// RunStore - durable run state plus the run's clusters, metrics and artifacts.
//
// Postgres implementations back production; `memory` provides in-process ones
// with failure injection so pipeline tests need no database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use themewatch_common::{AnalysisRun, Cluster, Owner, TemporalMetric, TopicId};

use crate::error::StoreError;

/// A stored point: document id, embedding and free-form payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub embedding: Vec<f32>,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// VectorIndex
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError>;

    /// All points of a collection, ordered by id.
    async fn scroll(&self, collection: &str) -> Result<Vec<VectorPoint>, StoreError>;

    async fn point_exists(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Merge `patch` into the point's payload. Returns false when the point is absent.
    async fn set_payload(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// ArticleStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Apply one batch of topic assignments to `owner`'s table in a single
    /// transaction. Ids not present in that table are ignored. Returns rows updated.
    async fn update_topics(
        &self,
        owner: Owner,
        run_id: Uuid,
        batch: &[(String, TopicId)],
    ) -> Result<u64, StoreError>;

    async fn topic_of(&self, owner: Owner, id: &str) -> Result<Option<TopicId>, StoreError>;
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or update the run row.
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), StoreError>;

    async fn load_run(&self, id: Uuid) -> Result<Option<AnalysisRun>, StoreError>;

    /// Most recent run for `scope` whose status is completed or partial.
    async fn last_finished_run(&self, scope: &str) -> Result<Option<AnalysisRun>, StoreError>;

    /// Replace the run's clusters. Member indices are not persisted, member ids are.
    async fn save_clusters(&self, run_id: Uuid, clusters: &[Cluster]) -> Result<(), StoreError>;

    async fn load_clusters(&self, run_id: Uuid) -> Result<Vec<Cluster>, StoreError>;

    /// Append metrics. A `(cluster, window)` pair already stored for the run is kept as is.
    async fn append_temporal_metrics(
        &self,
        run_id: Uuid,
        metrics: &[TemporalMetric],
    ) -> Result<(), StoreError>;

    async fn load_temporal_metrics(&self, run_id: Uuid) -> Result<Vec<TemporalMetric>, StoreError>;

    /// Store a named JSON artifact of the run (outlier summary, merge suggestions, ...).
    async fn save_artifact(
        &self,
        run_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn load_artifact(
        &self,
        run_id: Uuid,
        kind: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Take the per-scope lock. Returns false when another live run holds it.
    /// Locks older than `ttl_minutes` are treated as abandoned.
    async fn acquire_scope_lock(&self, scope: &str, ttl_minutes: i64) -> Result<bool, StoreError>;

    async fn release_scope_lock(&self, scope: &str) -> Result<(), StoreError>;
}
