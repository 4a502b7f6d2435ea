// Seams to the external stages that consume a run's output.
//
// TopicEnricher - narrative enrichment over cluster summaries (no embeddings).
// GapAnalyzer - coverage gaps between populations, over ownership partitions.
//
// Both are optional. A stage is declared on a run only when its collaborator is
// supplied, and either may exhaust its retries without failing the run.

use async_trait::async_trait;
use uuid::Uuid;

use themewatch_common::ThemeWatchError;

use crate::summary::{ClusterSummary, OwnershipPartition};

#[async_trait]
pub trait TopicEnricher: Send + Sync {
    async fn enrich(&self, run_id: Uuid, summaries: &[ClusterSummary]) -> Result<(), ThemeWatchError>;
}

#[async_trait]
pub trait GapAnalyzer: Send + Sync {
    async fn analyze(&self, run_id: Uuid, partitions: &[OwnershipPartition]) -> Result<(), ThemeWatchError>;
}
