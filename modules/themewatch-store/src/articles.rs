use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use themewatch_common::{Owner, TopicId};

use crate::error::StoreError;
use crate::traits::ArticleStore;

/// Relational article tables (`client_articles`, `competitor_articles`).
///
/// Each batch runs in its own short transaction: rows are grouped by topic and
/// written with `UPDATE ... WHERE id = ANY($ids)`, so a failed batch rolls back
/// only itself.
#[derive(Clone)]
pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn update_topics(
        &self,
        owner: Owner,
        run_id: Uuid,
        batch: &[(String, TopicId)],
    ) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut by_topic: BTreeMap<TopicId, Vec<String>> = BTreeMap::new();
        for (id, topic) in batch {
            by_topic.entry(*topic).or_default().push(id.clone());
        }

        let sql = format!(
            "UPDATE {} SET topic_id = $1, topic_run_id = $2, topic_assigned_at = now()
             WHERE id = ANY($3)",
            owner.table()
        );

        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for (topic, ids) in &by_topic {
            let result = sqlx::query(&sql)
                .bind(*topic)
                .bind(run_id)
                .bind(ids)
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;

        debug!(%owner, batch = batch.len(), updated, "Applied topic batch");
        Ok(updated)
    }

    async fn topic_of(&self, owner: Owner, id: &str) -> Result<Option<TopicId>, StoreError> {
        let sql = format!("SELECT topic_id FROM {} WHERE id = $1", owner.table());
        let row: Option<(Option<i64>,)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|(topic,)| topic))
    }
}
