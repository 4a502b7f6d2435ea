pub mod config;
pub mod error;
pub mod run;
pub mod types;

pub use config::{
    AssignmentConfig, ClusterParams, ClusterProfile, Config, DiscoveryConfig, DistanceMetric,
    FetchConfig, LabelerConfig, OutlierConfig, PipelineConfig, PotentialWeights, TemporalConfig,
};
pub use error::ThemeWatchError;
pub use run::{AnalysisRun, RunCounts, RunStatus, Stage, StageState, StageStatus};
pub use types::*;
