use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ThemeWatchError {
    #[error("Insufficient data: {found} documents, {required} required")]
    InsufficientData { found: usize, required: usize },

    #[error("Clustering computation failed: {0}")]
    ClusteringComputation(String),

    #[error("Partial propagation: {vector} assigned in vector store, {relational} in relational store, {errors} errors")]
    PartialPropagation {
        vector: usize,
        relational: usize,
        errors: usize,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Analysis lock conflict: another run is in progress for scope {0}")]
    ScopeLocked(String),

    #[error("Stage {stage} cannot start: {reason}")]
    StageNotReady { stage: String, reason: String },

    /// The run is saved as is and can be resumed by id.
    #[error("Run {run_id} cancelled before stage {stage}")]
    Cancelled { run_id: Uuid, stage: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ThemeWatchError {
    /// Whether retrying the failed operation can succeed without new input data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ThemeWatchError::ClusteringComputation(_)
                | ThemeWatchError::PartialPropagation { .. }
                | ThemeWatchError::StoreUnavailable(_)
        )
    }

    /// Short machine-readable kind, persisted on the run as the most specific failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ThemeWatchError::InsufficientData { .. } => "insufficient_data",
            ThemeWatchError::ClusteringComputation(_) => "clustering_computation",
            ThemeWatchError::PartialPropagation { .. } => "partial_propagation",
            ThemeWatchError::StoreUnavailable(_) => "store_unavailable",
            ThemeWatchError::Configuration(_) => "configuration",
            ThemeWatchError::Validation(_) => "validation",
            ThemeWatchError::ScopeLocked(_) => "scope_locked",
            ThemeWatchError::StageNotReady { .. } => "stage_not_ready",
            ThemeWatchError::Cancelled { .. } => "cancelled",
            ThemeWatchError::Database(_) => "database",
            ThemeWatchError::Anyhow(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_taxonomy() {
        assert!(ThemeWatchError::ClusteringComputation("nan".into()).is_retryable());
        assert!(ThemeWatchError::StoreUnavailable("pool timed out".into()).is_retryable());
        assert!(ThemeWatchError::PartialPropagation { vector: 1, relational: 0, errors: 1 }
            .is_retryable());

        assert!(!ThemeWatchError::InsufficientData { found: 15, required: 50 }.is_retryable());
        assert!(!ThemeWatchError::Configuration("windows empty".into()).is_retryable());
    }

    #[test]
    fn insufficient_data_message_names_counts() {
        let err = ThemeWatchError::InsufficientData { found: 15, required: 50 };
        assert_eq!(err.to_string(), "Insufficient data: 15 documents, 50 required");
        assert_eq!(err.kind(), "insufficient_data");
    }
}
