use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{VectorIndex, VectorPoint};

/// Vector index backed by Postgres.
///
/// Collections are rows of `vector_collections`; points live in `vector_points`
/// keyed by `(collection, id)` with a `FLOAT4[]` embedding and a JSONB payload.
#[derive(Clone)]
pub struct PgVectorIndex {
    pool: PgPool,
}

impl PgVectorIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a collection. Idempotent.
    pub async fn create_collection(&self, collection: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO vector_collections (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or replace a point.
    pub async fn upsert(&self, collection: &str, point: &VectorPoint) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vector_points (collection, id, embedding, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (collection, id)
             DO UPDATE SET embedding = EXCLUDED.embedding, payload = EXCLUDED.payload",
        )
        .bind(collection)
        .bind(&point.id)
        .bind(&point.embedding)
        .bind(&point.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM vector_collections WHERE name = $1)")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn scroll(&self, collection: &str) -> Result<Vec<VectorPoint>, StoreError> {
        let rows: Vec<(String, Vec<f32>, serde_json::Value)> = sqlx::query_as(
            "SELECT id, embedding, payload FROM vector_points
             WHERE collection = $1
             ORDER BY id ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        debug!(collection, points = rows.len(), "Scrolled vector collection");

        Ok(rows
            .into_iter()
            .map(|(id, embedding, payload)| VectorPoint {
                id,
                embedding,
                payload,
            })
            .collect())
    }

    async fn point_exists(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM vector_points WHERE collection = $1 AND id = $2)",
        )
        .bind(collection)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn set_payload(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE vector_points SET payload = payload || $3
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(&patch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
