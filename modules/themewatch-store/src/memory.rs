// In-memory stores for tests.
//
// Three fakes matching the three trait boundaries:
// - InMemoryVectorIndex (VectorIndex) - collections of points, with per-point
//   permanent or transient failure injection
// - InMemoryArticleStore (ArticleStore) - two population tables, with batch
//   failure injection keyed by document id
// - InMemoryRunStore (RunStore) - runs, clusters, metrics, artifacts, scope locks

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use themewatch_common::{AnalysisRun, Cluster, Owner, RunStatus, TemporalMetric, TopicId};

use crate::error::StoreError;
use crate::traits::{ArticleStore, RunStore, VectorIndex, VectorPoint};

// ---------------------------------------------------------------------------
// InMemoryVectorIndex
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryVectorIndex {
    inner: Mutex<VectorInner>,
}

#[derive(Default)]
struct VectorInner {
    collections: BTreeMap<String, BTreeMap<String, VectorPoint>>,
    broken: HashSet<(String, String)>,
    flaky: HashMap<(String, String), u32>,
    payload_writes: u64,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, collection: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .collections
            .entry(collection.to_string())
            .or_default();
        self
    }

    pub fn insert(&self, collection: &str, point: VectorPoint) {
        self.inner
            .lock()
            .unwrap()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(point.id.clone(), point);
    }

    /// Every lookup of this point fails as unavailable.
    pub fn break_point(&self, collection: &str, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .broken
            .insert((collection.to_string(), id.to_string()));
    }

    /// The next `failures` lookups of this point fail as unavailable.
    pub fn flaky_point(&self, collection: &str, id: &str, failures: u32) {
        self.inner
            .lock()
            .unwrap()
            .flaky
            .insert((collection.to_string(), id.to_string()), failures);
    }

    pub fn payload(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .and_then(|points| points.get(id))
            .map(|p| p.payload.clone())
    }

    pub fn payload_writes(&self) -> u64 {
        self.inner.lock().unwrap().payload_writes
    }
}

impl VectorInner {
    fn check(&mut self, collection: &str, id: &str) -> Result<(), StoreError> {
        let key = (collection.to_string(), id.to_string());
        if self.broken.contains(&key) {
            return Err(StoreError::Unavailable(format!("{collection}/{id} unreachable")));
        }
        if let Some(remaining) = self.flaky.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("{collection}/{id} timed out")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().collections.contains_key(collection))
    }

    async fn scroll(&self, collection: &str) -> Result<Vec<VectorPoint>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let points = inner
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::Query(format!("no collection {collection}")))?;
        Ok(points.values().cloned().collect())
    }

    async fn point_exists(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(collection, id)?;
        Ok(inner
            .collections
            .get(collection)
            .is_some_and(|points| points.contains_key(id)))
    }

    async fn set_payload(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(collection, id)?;
        let Some(point) = inner
            .collections
            .get_mut(collection)
            .and_then(|points| points.get_mut(id))
        else {
            return Ok(false);
        };

        if let (Some(target), Some(fields)) = (point.payload.as_object_mut(), patch.as_object()) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        } else {
            point.payload = patch;
        }
        inner.payload_writes += 1;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// InMemoryArticleStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryArticleStore {
    inner: Mutex<ArticleInner>,
}

#[derive(Default)]
struct ArticleInner {
    rows: HashMap<Owner, BTreeMap<String, Option<TopicId>>>,
    poison: HashSet<String>,
    unavailable_batches: u32,
    batches_committed: u64,
}

impl InMemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_article(&self, owner: Owner, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .rows
            .entry(owner)
            .or_default()
            .insert(id.to_string(), None);
    }

    /// Any batch touching `id` in its own table fails with a query error and is rolled back.
    pub fn poison(&self, id: &str) {
        self.inner.lock().unwrap().poison.insert(id.to_string());
    }

    /// The next `n` batch writes fail as unavailable.
    pub fn fail_next_batches(&self, n: u32) {
        self.inner.lock().unwrap().unavailable_batches = n;
    }

    pub fn batches_committed(&self) -> u64 {
        self.inner.lock().unwrap().batches_committed
    }
}

#[async_trait]
impl ArticleStore for InMemoryArticleStore {
    async fn update_topics(
        &self,
        owner: Owner,
        _run_id: Uuid,
        batch: &[(String, TopicId)],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable_batches > 0 {
            inner.unavailable_batches -= 1;
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        let poisoned = batch.iter().find(|(id, _)| {
            inner.poison.contains(id)
                && inner.rows.get(&owner).is_some_and(|table| table.contains_key(id))
        });
        if let Some((id, _)) = poisoned {
            return Err(StoreError::Query(format!("constraint violated by {id}")));
        }

        let table = inner.rows.entry(owner).or_default();
        let mut updated = 0u64;
        for (id, topic) in batch {
            if let Some(slot) = table.get_mut(id) {
                *slot = Some(*topic);
                updated += 1;
            }
        }
        inner.batches_committed += 1;
        Ok(updated)
    }

    async fn topic_of(&self, owner: Owner, id: &str) -> Result<Option<TopicId>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .get(&owner)
            .and_then(|table| table.get(id).copied().flatten()))
    }
}

// ---------------------------------------------------------------------------
// InMemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRunStore {
    inner: Mutex<RunInner>,
}

#[derive(Default)]
struct RunInner {
    runs: HashMap<Uuid, AnalysisRun>,
    clusters: HashMap<Uuid, Vec<Cluster>>,
    metrics: HashMap<Uuid, Vec<TemporalMetric>>,
    artifacts: HashMap<(Uuid, String), serde_json::Value>,
    locks: HashMap<String, chrono::DateTime<Utc>>,
    fail_cluster_saves: u32,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` cluster saves fail as unavailable.
    pub fn fail_next_cluster_saves(&self, n: u32) {
        self.inner.lock().unwrap().fail_cluster_saves = n;
    }

    pub fn is_locked(&self, scope: &str) -> bool {
        self.inner.lock().unwrap().locks.contains_key(scope)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), StoreError> {
        self.inner.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<AnalysisRun>, StoreError> {
        Ok(self.inner.lock().unwrap().runs.get(&id).cloned())
    }

    async fn last_finished_run(&self, scope: &str) -> Result<Option<AnalysisRun>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| r.scope == scope)
            .filter(|r| matches!(r.status(), RunStatus::Completed | RunStatus::Partial))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn save_clusters(&self, run_id: Uuid, clusters: &[Cluster]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_cluster_saves > 0 {
            inner.fail_cluster_saves -= 1;
            return Err(StoreError::Unavailable("run store restarting".into()));
        }
        let stored = clusters
            .iter()
            .map(|c| Cluster {
                members: Vec::new(),
                ..c.clone()
            })
            .collect();
        inner.clusters.insert(run_id, stored);
        Ok(())
    }

    async fn load_clusters(&self, run_id: Uuid) -> Result<Vec<Cluster>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .clusters
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_temporal_metrics(
        &self,
        run_id: Uuid,
        metrics: &[TemporalMetric],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.metrics.entry(run_id).or_default();
        for metric in metrics {
            let exists = stored
                .iter()
                .any(|m| m.cluster_id == metric.cluster_id && m.window_days == metric.window_days);
            if !exists {
                stored.push(metric.clone());
            }
        }
        Ok(())
    }

    async fn load_temporal_metrics(&self, run_id: Uuid) -> Result<Vec<TemporalMetric>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .metrics
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_artifact(
        &self,
        run_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .insert((run_id, kind.to_string()), payload);
        Ok(())
    }

    async fn load_artifact(
        &self,
        run_id: Uuid,
        kind: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .artifacts
            .get(&(run_id, kind.to_string()))
            .cloned())
    }

    async fn acquire_scope_lock(&self, scope: &str, ttl_minutes: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(started) = inner.locks.get(scope) {
            if *started >= now - Duration::minutes(ttl_minutes) {
                return Ok(false);
            }
        }
        inner.locks.insert(scope.to_string(), now);
        Ok(true)
    }

    async fn release_scope_lock(&self, scope: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().locks.remove(scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(id: &str) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            embedding: vec![1.0, 0.0],
            payload: json!({"title": id}),
        }
    }

    #[tokio::test]
    async fn set_payload_merges_fields() {
        let index = InMemoryVectorIndex::new().with_collection("client_articles");
        index.insert("client_articles", point("a"));

        let updated = index
            .set_payload("client_articles", "a", json!({"topic_id": 3}))
            .await
            .unwrap();
        assert!(updated);

        let payload = index.payload("client_articles", "a").unwrap();
        assert_eq!(payload["title"], "a");
        assert_eq!(payload["topic_id"], 3);
    }

    #[tokio::test]
    async fn flaky_point_recovers_after_failures() {
        let index = InMemoryVectorIndex::new().with_collection("c");
        index.insert("c", point("a"));
        index.flaky_point("c", "a", 2);

        assert!(index.point_exists("c", "a").await.is_err());
        assert!(index.point_exists("c", "a").await.is_err());
        assert!(index.point_exists("c", "a").await.unwrap());
    }

    #[tokio::test]
    async fn poisoned_batch_leaves_rows_untouched() {
        let store = InMemoryArticleStore::new();
        store.insert_article(Owner::Client, "a");
        store.insert_article(Owner::Client, "b");
        store.poison("b");

        let batch = vec![("a".to_string(), 1), ("b".to_string(), 1)];
        assert!(store.update_topics(Owner::Client, Uuid::new_v4(), &batch).await.is_err());
        assert_eq!(store.topic_of(Owner::Client, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scope_lock_is_exclusive_until_released() {
        let store = InMemoryRunStore::new();
        assert!(store.acquire_scope_lock("acme", 30).await.unwrap());
        assert!(!store.acquire_scope_lock("acme", 30).await.unwrap());
        assert!(store.acquire_scope_lock("other", 30).await.unwrap());

        store.release_scope_lock("acme").await.unwrap();
        assert!(store.acquire_scope_lock("acme", 30).await.unwrap());
    }
}
