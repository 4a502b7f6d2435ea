//! RunStore backed by Postgres.
//!
//! Run state lives in `analysis_runs` with stage states and counts as JSONB.
//! Outputs are keyed by run id: `run_clusters`, append-only `temporal_metrics`,
//! and `run_artifacts` for everything else.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use themewatch_common::{AnalysisRun, Cluster, TemporalMetric, TopTerm};

use crate::error::StoreError;
use crate::traits::RunStore;

#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type RunRow = (
    Uuid,
    String,
    serde_json::Value,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn run_from_row(row: RunRow) -> Result<AnalysisRun, StoreError> {
    let (id, scope, stages, counts, created_at, updated_at) = row;
    Ok(AnalysisRun {
        id,
        scope,
        stages: serde_json::from_value(stages)?,
        counts: serde_json::from_value(counts)?,
        created_at,
        updated_at,
    })
}

type MetricRow = (
    i64,
    i32,
    DateTime<Utc>,
    DateTime<Utc>,
    i32,
    f64,
    f64,
    i32,
    Option<f64>,
    f64,
    bool,
    Option<f64>,
);

#[async_trait]
impl RunStore for PgRunStore {
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_runs (id, scope, status, stages, counts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                stages = EXCLUDED.stages,
                counts = EXCLUDED.counts,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.id)
        .bind(&run.scope)
        .bind(run.status().to_string())
        .bind(serde_json::to_value(&run.stages)?)
        .bind(serde_json::to_value(&run.counts)?)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<AnalysisRun>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, scope, stages, counts, created_at, updated_at
             FROM analysis_runs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    async fn last_finished_run(&self, scope: &str) -> Result<Option<AnalysisRun>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, scope, stages, counts, created_at, updated_at
             FROM analysis_runs
             WHERE scope = $1 AND status IN ('completed', 'partial')
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    async fn save_clusters(&self, run_id: Uuid, clusters: &[Cluster]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_clusters WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        for cluster in clusters {
            sqlx::query(
                r#"
                INSERT INTO run_clusters
                    (run_id, cluster_id, label, top_terms, size, centroid, coherence,
                     representative_docs, member_ids)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(run_id)
            .bind(cluster.id)
            .bind(&cluster.label)
            .bind(serde_json::to_value(&cluster.top_terms)?)
            .bind(cluster.size as i64)
            .bind(&cluster.centroid)
            .bind(cluster.coherence)
            .bind(serde_json::to_value(&cluster.representative_docs)?)
            .bind(&cluster.member_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(%run_id, clusters = clusters.len(), "Saved run clusters");
        Ok(())
    }

    async fn load_clusters(&self, run_id: Uuid) -> Result<Vec<Cluster>, StoreError> {
        let rows: Vec<(
            i64,
            String,
            serde_json::Value,
            i64,
            Vec<f32>,
            Option<f64>,
            serde_json::Value,
            Vec<String>,
        )> = sqlx::query_as(
            "SELECT cluster_id, label, top_terms, size, centroid, coherence,
                    representative_docs, member_ids
             FROM run_clusters WHERE run_id = $1
             ORDER BY cluster_id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, label, top_terms, size, centroid, coherence, representative_docs, member_ids)|
                 -> Result<Cluster, StoreError> {
                    let top_terms: Vec<TopTerm> = serde_json::from_value(top_terms)?;
                    let representative_docs: Vec<String> = serde_json::from_value(representative_docs)?;
                    Ok(Cluster {
                        id,
                        label,
                        top_terms,
                        size: size.max(0) as usize,
                        centroid,
                        coherence,
                        representative_docs,
                        members: Vec::new(),
                        member_ids,
                    })
                },
            )
            .collect()
    }

    async fn append_temporal_metrics(
        &self,
        run_id: Uuid,
        metrics: &[TemporalMetric],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for m in metrics {
            let result = sqlx::query(
                r#"
                INSERT INTO temporal_metrics
                    (run_id, cluster_id, window_days, window_start, window_end, volume, velocity,
                     freshness_ratio, source_diversity, cohesion_score, potential_score,
                     drift_detected, drift_distance)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (run_id, cluster_id, window_days) DO NOTHING
                "#,
            )
            .bind(run_id)
            .bind(m.cluster_id)
            .bind(m.window_days as i32)
            .bind(m.window_start)
            .bind(m.window_end)
            .bind(m.volume as i32)
            .bind(m.velocity)
            .bind(m.freshness_ratio)
            .bind(m.source_diversity as i32)
            .bind(m.cohesion_score)
            .bind(m.potential_score)
            .bind(m.drift_detected)
            .bind(m.drift_distance)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        let skipped = metrics.len() as u64 - inserted;
        if skipped > 0 {
            warn!(%run_id, skipped, "Temporal metrics already present, kept existing rows");
        }
        Ok(())
    }

    async fn load_temporal_metrics(&self, run_id: Uuid) -> Result<Vec<TemporalMetric>, StoreError> {
        let rows: Vec<MetricRow> = sqlx::query_as(
            "SELECT cluster_id, window_days, window_start, window_end, volume, velocity,
                    freshness_ratio, source_diversity, cohesion_score, potential_score,
                    drift_detected, drift_distance
             FROM temporal_metrics WHERE run_id = $1
             ORDER BY cluster_id ASC, window_days ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    cluster_id,
                    window_days,
                    window_start,
                    window_end,
                    volume,
                    velocity,
                    freshness_ratio,
                    source_diversity,
                    cohesion_score,
                    potential_score,
                    drift_detected,
                    drift_distance,
                )| TemporalMetric {
                    cluster_id,
                    window_days: window_days.max(0) as u32,
                    window_start,
                    window_end,
                    volume: volume.max(0) as u32,
                    velocity,
                    freshness_ratio,
                    source_diversity: source_diversity.max(0) as u32,
                    cohesion_score,
                    potential_score,
                    drift_detected,
                    drift_distance,
                },
            )
            .collect())
    }

    async fn save_artifact(
        &self,
        run_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO run_artifacts (run_id, kind, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (run_id, kind) DO UPDATE SET payload = EXCLUDED.payload",
        )
        .bind(run_id)
        .bind(kind)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_artifact(
        &self,
        run_id: Uuid,
        kind: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT payload FROM run_artifacts WHERE run_id = $1 AND kind = $2")
                .bind(run_id)
                .bind(kind)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(payload,)| payload))
    }

    /// Stale locks are deleted first, then an insert races on the primary key,
    /// so check-and-take is a single atomic statement.
    async fn acquire_scope_lock(&self, scope: &str, ttl_minutes: i64) -> Result<bool, StoreError> {
        sqlx::query(
            "DELETE FROM analysis_locks
             WHERE scope = $1 AND started_at < now() - make_interval(mins => $2)",
        )
        .bind(scope)
        .bind(ttl_minutes as i32)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            "INSERT INTO analysis_locks (scope, started_at) VALUES ($1, now())
             ON CONFLICT (scope) DO NOTHING",
        )
        .bind(scope)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_scope_lock(&self, scope: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM analysis_locks WHERE scope = $1")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
