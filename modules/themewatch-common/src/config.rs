use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ThemeWatchError;

// --- Clustering ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

/// Corpus-size profiles. Larger corpora need larger minimum cluster sizes,
/// otherwise HDBSCAN fragments them into micro-clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterProfile {
    /// Fewer than 200 documents.
    Small,
    /// 200 to 1999 documents.
    Medium,
    /// 2000 documents and up.
    Large,
}

impl ClusterProfile {
    pub fn for_corpus_size(n: usize) -> Self {
        if n < 200 {
            ClusterProfile::Small
        } else if n < 2000 {
            ClusterProfile::Medium
        } else {
            ClusterProfile::Large
        }
    }

    pub fn params(&self) -> ClusterParams {
        let (min_cluster_size, min_samples, min_documents, n_neighbors) = match self {
            ClusterProfile::Small => (5, 3, 20, 10),
            ClusterProfile::Medium => (10, 5, 50, 15),
            ClusterProfile::Large => (25, 10, 50, 30),
        };
        ClusterParams {
            min_cluster_size,
            min_samples,
            min_documents,
            target_dims: 5,
            n_neighbors,
            metric: DistanceMetric::Cosine,
            top_n_terms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Smallest group HDBSCAN will report as a cluster.
    pub min_cluster_size: usize,
    /// Neighbors used for a point's core distance.
    pub min_samples: usize,
    /// Below this corpus size clustering is not attempted.
    pub min_documents: usize,
    /// Dimensionality after projection.
    pub target_dims: usize,
    /// Neighborhood used to smooth the projection. 0 disables smoothing.
    pub n_neighbors: usize,
    pub metric: DistanceMetric,
    pub top_n_terms: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterProfile::Medium.params()
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<(), ThemeWatchError> {
        if self.min_cluster_size < 2 {
            return Err(ThemeWatchError::Configuration(format!(
                "min_cluster_size must be >= 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.min_samples < 1 || self.min_samples > self.min_cluster_size {
            return Err(ThemeWatchError::Configuration(format!(
                "min_samples must be in 1..={}, got {}",
                self.min_cluster_size, self.min_samples
            )));
        }
        if self.min_documents < self.min_cluster_size {
            return Err(ThemeWatchError::Configuration(format!(
                "min_documents ({}) must be >= min_cluster_size ({})",
                self.min_documents, self.min_cluster_size
            )));
        }
        if self.target_dims < 2 {
            return Err(ThemeWatchError::Configuration(format!(
                "target_dims must be >= 2, got {}",
                self.target_dims
            )));
        }
        if self.top_n_terms == 0 {
            return Err(ThemeWatchError::Configuration("top_n_terms must be > 0".into()));
        }
        Ok(())
    }
}

// --- Stage configs ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Minimum corpus size before clustering is attempted at all.
    pub min_documents: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { min_documents: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelerConfig {
    pub label_words: usize,
    pub max_excerpts: usize,
    pub excerpt_chars: usize,
    /// Label term-set similarity at or above which a merge is suggested.
    pub merge_threshold: f64,
    /// Members sampled for pairwise coherence in large clusters.
    pub coherence_sample: usize,
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            label_words: 3,
            max_excerpts: 3,
            excerpt_chars: 300,
            merge_threshold: 0.5,
            coherence_sample: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierConfig {
    pub max_outliers: usize,
    pub min_word_count: usize,
    /// Nearest-centroid distance below which an outlier straddles topics.
    pub low_distance: f64,
    /// Nearest-centroid distance above which an outlier is unlike any topic.
    pub high_distance: f64,
    pub potential_min_cluster_size: usize,
    pub potential_min_samples: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            max_outliers: 1000,
            min_word_count: 50,
            low_distance: 0.3,
            high_distance: 0.6,
            potential_min_cluster_size: 3,
            potential_min_samples: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentConfig {
    pub batch_size: usize,
    /// In-flight vector-store lookups per run.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 8,
            max_attempts: 3,
            base_backoff_ms: 200,
        }
    }
}

/// Weights of the composite potential score. They sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialWeights {
    pub volume: f64,
    pub growth: f64,
    pub freshness: f64,
    pub diversity: f64,
    pub cohesion: f64,
}

impl Default for PotentialWeights {
    fn default() -> Self {
        Self {
            volume: 0.25,
            growth: 0.30,
            freshness: 0.20,
            diversity: 0.15,
            cohesion: 0.10,
        }
    }
}

impl PotentialWeights {
    pub fn total(&self) -> f64 {
        self.volume + self.growth + self.freshness + self.diversity + self.cohesion
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalConfig {
    pub windows_days: Vec<u32>,
    /// Centroid cosine distance between consecutive windows that flags drift.
    pub drift_threshold: f64,
    /// Volume at which the volume component of the potential score saturates.
    pub saturation_volume: u32,
    /// Distinct domains at which the diversity component saturates.
    pub saturation_domains: u32,
    pub weights: PotentialWeights,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            windows_days: vec![7, 30, 365],
            drift_threshold: 0.15,
            saturation_volume: 20,
            saturation_domains: 5,
            weights: PotentialWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_stage_attempts: u32,
    pub lock_ttl_minutes: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_stage_attempts: 3,
            lock_ttl_minutes: 30,
        }
    }
}

/// All tunables of an analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub fetch: FetchConfig,
    /// Fixed clustering parameters. `None` picks a profile from the corpus size.
    pub cluster: Option<ClusterParams>,
    pub labeler: LabelerConfig,
    pub outliers: OutlierConfig,
    pub assignment: AssignmentConfig,
    pub temporal: TemporalConfig,
    pub pipeline: PipelineConfig,
}

impl DiscoveryConfig {
    /// Clustering parameters for a corpus of `n` documents.
    pub fn cluster_params_for(&self, n: usize) -> ClusterParams {
        self.cluster
            .clone()
            .unwrap_or_else(|| ClusterProfile::for_corpus_size(n).params())
    }

    /// Reject invalid thresholds and windows. Runs before any stage progress is recorded.
    pub fn validate(&self) -> Result<(), ThemeWatchError> {
        if let Some(params) = &self.cluster {
            params.validate()?;
        }
        if self.fetch.min_documents == 0 {
            return Err(ThemeWatchError::Configuration("fetch.min_documents must be > 0".into()));
        }
        if self.labeler.label_words == 0 {
            return Err(ThemeWatchError::Configuration("labeler.label_words must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.labeler.merge_threshold) {
            return Err(ThemeWatchError::Configuration(format!(
                "labeler.merge_threshold must be in [0, 1], got {}",
                self.labeler.merge_threshold
            )));
        }

        let o = &self.outliers;
        if o.low_distance < 0.0 || o.low_distance > o.high_distance {
            return Err(ThemeWatchError::Configuration(format!(
                "outlier distance thresholds must satisfy 0 <= low ({}) <= high ({})",
                o.low_distance, o.high_distance
            )));
        }
        if o.potential_min_cluster_size < 2
            || o.potential_min_samples < 1
            || o.potential_min_samples > o.potential_min_cluster_size
        {
            return Err(ThemeWatchError::Configuration(
                "outlier sub-clustering needs min_cluster_size >= 2 and 1 <= min_samples <= min_cluster_size".into(),
            ));
        }

        let a = &self.assignment;
        if a.batch_size == 0 || a.concurrency == 0 || a.max_attempts == 0 {
            return Err(ThemeWatchError::Configuration(
                "assignment batch_size, concurrency and max_attempts must be > 0".into(),
            ));
        }

        let t = &self.temporal;
        if t.windows_days.is_empty() {
            return Err(ThemeWatchError::Configuration("temporal.windows_days is empty".into()));
        }
        if t.windows_days.iter().any(|w| *w == 0) {
            return Err(ThemeWatchError::Configuration("temporal windows must be > 0 days".into()));
        }
        if t.drift_threshold <= 0.0 || t.drift_threshold > 2.0 {
            return Err(ThemeWatchError::Configuration(format!(
                "temporal.drift_threshold must be in (0, 2], got {}",
                t.drift_threshold
            )));
        }
        if t.saturation_volume == 0 || t.saturation_domains == 0 {
            return Err(ThemeWatchError::Configuration("temporal saturation points must be > 0".into()));
        }
        if (t.weights.total() - 1.0).abs() > 1e-6 {
            return Err(ThemeWatchError::Configuration(format!(
                "potential weights must sum to 1.0, got {}",
                t.weights.total()
            )));
        }

        if self.pipeline.max_stage_attempts == 0 {
            return Err(ThemeWatchError::Configuration("pipeline.max_stage_attempts must be > 0".into()));
        }
        Ok(())
    }
}

// --- Process config ---

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `DATABASE_URL` is required. `THEMEWATCH_*` variables override discovery defaults.
    pub fn from_env() -> Result<Self, ThemeWatchError> {
        let database_url = required_env("DATABASE_URL")?;
        let max_connections = parse_env("THEMEWATCH_MAX_CONNECTIONS")?.unwrap_or(10);

        let mut discovery = DiscoveryConfig::default();
        if let Some(min) = parse_env("THEMEWATCH_MIN_DOCUMENTS")? {
            discovery.fetch.min_documents = min;
        }
        if let Some(batch) = parse_env("THEMEWATCH_BATCH_SIZE")? {
            discovery.assignment.batch_size = batch;
        }
        if let Some(max) = parse_env("THEMEWATCH_MAX_OUTLIERS")? {
            discovery.outliers.max_outliers = max;
        }
        if let Some(threshold) = parse_env("THEMEWATCH_DRIFT_THRESHOLD")? {
            discovery.temporal.drift_threshold = threshold;
        }
        if let Ok(windows) = env::var("THEMEWATCH_WINDOWS") {
            discovery.temporal.windows_days = parse_windows(&windows)?;
        }
        discovery.validate()?;

        Ok(Self {
            database_url,
            max_connections,
            discovery,
        })
    }

    /// Log the effective configuration without credentials.
    pub fn log_redacted(&self) {
        info!(
            database_url = redact_url(&self.database_url).as_str(),
            max_connections = self.max_connections,
            min_documents = self.discovery.fetch.min_documents,
            windows = ?self.discovery.temporal.windows_days,
            batch_size = self.discovery.assignment.batch_size,
            "Configuration loaded"
        );
    }
}

/// Parse a comma-separated list of window sizes in days, e.g. `"7,30,365"`.
pub fn parse_windows(raw: &str) -> Result<Vec<u32>, ThemeWatchError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| ThemeWatchError::Configuration(format!("invalid window size: {s}")))
        })
        .collect()
}

fn required_env(key: &str) -> Result<String, ThemeWatchError> {
    env::var(key).map_err(|_| ThemeWatchError::Configuration(format!("{key} environment variable is required")))
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ThemeWatchError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ThemeWatchError::Configuration(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_scale_with_corpus_size() {
        assert_eq!(ClusterProfile::for_corpus_size(50), ClusterProfile::Small);
        assert_eq!(ClusterProfile::for_corpus_size(200), ClusterProfile::Medium);
        assert_eq!(ClusterProfile::for_corpus_size(5000), ClusterProfile::Large);

        let small = ClusterProfile::Small.params();
        let large = ClusterProfile::Large.params();
        assert!(large.min_cluster_size > small.min_cluster_size);
        assert!(small.validate().is_ok());
        assert!(ClusterProfile::Medium.params().validate().is_ok());
        assert!(large.validate().is_ok());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(DiscoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn potential_weights_sum_to_one() {
        assert!((PotentialWeights::default().total() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn empty_windows_rejected() {
        let mut config = DiscoveryConfig::default();
        config.temporal.windows_days.clear();
        assert!(matches!(config.validate(), Err(ThemeWatchError::Configuration(_))));
    }

    #[test]
    fn inverted_outlier_thresholds_rejected() {
        let mut config = DiscoveryConfig::default();
        config.outliers.low_distance = 0.8;
        config.outliers.high_distance = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_samples_above_cluster_size_rejected() {
        let params = ClusterParams {
            min_cluster_size: 3,
            min_samples: 4,
            ..ClusterParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn parse_windows_accepts_spaces_and_rejects_garbage() {
        assert_eq!(parse_windows("7, 30,365").unwrap(), vec![7, 30, 365]);
        assert!(parse_windows("7,thirty").is_err());
    }

    #[test]
    fn redacts_credentials_in_database_url() {
        assert_eq!(
            redact_url("postgres://user:secret@db:5432/themes"),
            "postgres://***@db:5432/themes"
        );
        assert_eq!(redact_url("postgres://db/themes"), "postgres://db/themes");
    }
}
