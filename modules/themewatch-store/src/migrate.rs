use sqlx::PgPool;
use tracing::info;

use themewatch_common::Owner;

use crate::error::StoreError;

/// Run idempotent schema migrations for the vector index, run store and the
/// topic columns on the article tables.
///
/// The article tables belong to the ingestion side; only the topic columns are
/// added here, and only when the table already exists.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    info!("Running schema migrations...");

    let tables = [
        r#"CREATE TABLE IF NOT EXISTS vector_collections (
            name        TEXT         PRIMARY KEY,
            created_at  TIMESTAMPTZ  NOT NULL DEFAULT now()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS vector_points (
            collection  TEXT    NOT NULL REFERENCES vector_collections(name),
            id          TEXT    NOT NULL,
            embedding   FLOAT4[] NOT NULL,
            payload     JSONB   NOT NULL DEFAULT '{}'::jsonb,
            PRIMARY KEY (collection, id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS analysis_runs (
            id          UUID         PRIMARY KEY,
            scope       TEXT         NOT NULL,
            status      TEXT         NOT NULL,
            stages      JSONB        NOT NULL,
            counts      JSONB        NOT NULL,
            created_at  TIMESTAMPTZ  NOT NULL,
            updated_at  TIMESTAMPTZ  NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS run_clusters (
            run_id               UUID     NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
            cluster_id           BIGINT   NOT NULL,
            label                TEXT     NOT NULL,
            top_terms            JSONB    NOT NULL,
            size                 BIGINT   NOT NULL,
            centroid             FLOAT4[] NOT NULL,
            coherence            FLOAT8,
            representative_docs  JSONB    NOT NULL,
            member_ids           TEXT[]   NOT NULL,
            PRIMARY KEY (run_id, cluster_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS temporal_metrics (
            run_id            UUID         NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
            cluster_id        BIGINT       NOT NULL,
            window_days       INT          NOT NULL,
            window_start      TIMESTAMPTZ  NOT NULL,
            window_end        TIMESTAMPTZ  NOT NULL,
            volume            INT          NOT NULL,
            velocity          FLOAT8       NOT NULL,
            freshness_ratio   FLOAT8       NOT NULL,
            source_diversity  INT          NOT NULL,
            cohesion_score    FLOAT8,
            potential_score   FLOAT8       NOT NULL,
            drift_detected    BOOLEAN      NOT NULL,
            drift_distance    FLOAT8,
            PRIMARY KEY (run_id, cluster_id, window_days)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS run_artifacts (
            run_id   UUID   NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
            kind     TEXT   NOT NULL,
            payload  JSONB  NOT NULL,
            PRIMARY KEY (run_id, kind)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS analysis_locks (
            scope       TEXT         PRIMARY KEY,
            started_at  TIMESTAMPTZ  NOT NULL
        )"#,
    ];

    for ddl in &tables {
        sqlx::query(ddl).execute(pool).await?;
    }
    info!("Run store and vector tables ready");

    sqlx::query("CREATE INDEX IF NOT EXISTS analysis_runs_scope_idx ON analysis_runs (scope, created_at DESC)")
        .execute(pool)
        .await?;

    for owner in Owner::ALL {
        let table = owner.table();
        let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(pool)
            .await?;
        if !exists {
            info!(table, "Article table not present, skipping topic columns");
            continue;
        }
        for column in [
            "topic_id BIGINT",
            "topic_run_id UUID",
            "topic_assigned_at TIMESTAMPTZ",
        ] {
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column}"))
                .execute(pool)
                .await?;
        }
    }
    info!("Topic columns ready");

    Ok(())
}
