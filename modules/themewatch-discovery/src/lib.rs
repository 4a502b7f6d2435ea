pub mod assignment;
pub mod cluster;
pub mod fetcher;
pub mod hdbscan;
pub mod labeler;
pub mod outliers;
pub mod pipeline;
pub mod reduce;
pub mod similarity;
pub mod summary;
pub mod temporal;
pub mod terms;
pub mod traits;

pub use assignment::{AssignmentError, AssignmentReport, LookupOutcome, PropagationTarget, TopicAssignmentService};
pub use cluster::{ClusterEngine, ClusterResult};
pub use fetcher::{EmbeddingFetcher, FetchOutcome, FetchedCorpus, IncludePolicy};
pub use labeler::{MergeSuggestion, TopicLabeler};
pub use outliers::{OutlierHandler, OutlierReport};
pub use pipeline::{PipelineCoordinator, PipelineDeps};
pub use summary::{ClusterSummary, OwnershipPartition};
pub use temporal::TemporalMetricsEngine;
pub use traits::{GapAnalyzer, TopicEnricher};
