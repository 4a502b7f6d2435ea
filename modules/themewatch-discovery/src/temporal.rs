//! Temporal metrics: per cluster and per window, how much is being published,
//! how fast that is changing, and whether the topic's content is shifting.
//!
//! For a window of `w` days ending at `now`:
//!
//! - current window `[now - w, now]`, prior window `[now - 2w, now - w)`
//! - `volume`: members published in the current window
//! - `velocity`: `(volume - prior_volume) / w`, documents per day
//! - `freshness_ratio`: `volume / cluster size`
//! - `source_diversity`: distinct source domains in the current window
//! - `cohesion_score`: mean cosine of current-window members to their own centroid
//! - `drift_distance`: cosine distance between current and prior window centroids
//!
//! Every `(cluster, window)` pair yields a record; empty windows are zeros and
//! `None`, never skipped.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use themewatch_common::{Cluster, TemporalConfig, TemporalMetric, TopicId};

use crate::fetcher::FetchedCorpus;
use crate::similarity::{centroid, cosine_distance, mean_similarity_to};

/// What the engine needs to know about one cluster member.
#[derive(Debug, Clone, Copy)]
pub struct MemberRecord<'a> {
    pub published_at: Option<DateTime<Utc>>,
    pub source_domain: Option<&'a str>,
    pub embedding: &'a [f32],
}

pub struct TemporalMetricsEngine {
    config: TemporalConfig,
}

impl TemporalMetricsEngine {
    pub fn new(config: TemporalConfig) -> Self {
        Self { config }
    }

    /// Metrics for every cluster and every configured window. Members are
    /// resolved by document id so clusters reloaded from a previous attempt work
    /// as well as freshly built ones.
    pub fn compute(
        &self,
        clusters: &[Cluster],
        corpus: &FetchedCorpus,
        now: DateTime<Utc>,
    ) -> Vec<TemporalMetric> {
        let position: HashMap<&str, usize> = corpus
            .document_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let metrics: Vec<TemporalMetric> = clusters
            .iter()
            .flat_map(|cluster| {
                let indices: Vec<usize> = if cluster.member_ids.is_empty() {
                    cluster.members.clone()
                } else {
                    cluster
                        .member_ids
                        .iter()
                        .filter_map(|id| position.get(id.as_str()).copied())
                        .collect()
                };
                let members: Vec<MemberRecord<'_>> = indices
                    .iter()
                    .filter(|&&i| i < corpus.len())
                    .map(|&i| MemberRecord {
                        published_at: corpus.metadata[i].published_at,
                        source_domain: corpus.metadata[i].source_domain.as_deref(),
                        embedding: &corpus.embeddings[i],
                    })
                    .collect();
                self.compute_cluster(cluster.id, cluster.size, &members, now)
            })
            .collect();

        info!(
            clusters = clusters.len(),
            windows = ?self.config.windows_days,
            metrics = metrics.len(),
            drifting = metrics.iter().filter(|m| m.drift_detected).count(),
            "Temporal metrics computed"
        );
        metrics
    }

    /// One record per configured window, in configuration order.
    pub fn compute_cluster(
        &self,
        cluster_id: TopicId,
        size: usize,
        members: &[MemberRecord<'_>],
        now: DateTime<Utc>,
    ) -> Vec<TemporalMetric> {
        self.config
            .windows_days
            .iter()
            .map(|&days| self.window_metric(cluster_id, size, members, days, now))
            .collect()
    }

    fn window_metric(
        &self,
        cluster_id: TopicId,
        size: usize,
        members: &[MemberRecord<'_>],
        days: u32,
        now: DateTime<Utc>,
    ) -> TemporalMetric {
        let window = Duration::days(days as i64);
        let window_start = now - window;
        let prior_start = window_start - window;

        let in_range = |from: DateTime<Utc>, to: DateTime<Utc>, inclusive_end: bool| -> Vec<usize> {
            members
                .iter()
                .enumerate()
                .filter(|(_, m)| {
                    m.published_at.is_some_and(|p| {
                        p >= from && if inclusive_end { p <= to } else { p < to }
                    })
                })
                .map(|(i, _)| i)
                .collect()
        };
        let current = in_range(window_start, now, true);
        let prior = in_range(prior_start, window_start, false);

        let volume = current.len() as u32;
        let prior_volume = prior.len() as u32;
        let velocity = (volume as f64 - prior_volume as f64) / days as f64;
        let freshness_ratio = if size == 0 { 0.0 } else { volume as f64 / size as f64 };

        let domains: HashSet<&str> = current
            .iter()
            .filter_map(|&i| members[i].source_domain)
            .collect();
        let source_diversity = domains.len() as u32;

        let embeddings: Vec<&[f32]> = members.iter().map(|m| m.embedding).collect();
        let current_centroid = centroid(&embeddings, &current);
        let prior_centroid = centroid(&embeddings, &prior);
        let cohesion_score = mean_similarity_to(&embeddings, &current, &current_centroid);

        let drift_distance = if current.is_empty() || prior.is_empty() {
            None
        } else {
            Some(cosine_distance(&current_centroid, &prior_centroid))
        };
        let drift_detected = drift_distance.is_some_and(|d| d > self.config.drift_threshold);

        let potential_score = self.potential_score(
            volume,
            prior_volume,
            freshness_ratio,
            source_diversity,
            cohesion_score,
        );

        TemporalMetric {
            cluster_id,
            window_days: days,
            window_start,
            window_end: now,
            volume,
            velocity,
            freshness_ratio,
            source_diversity,
            cohesion_score,
            potential_score,
            drift_detected,
            drift_distance,
        }
    }

    /// Weighted blend of saturating components, each in `[0, 1]`:
    /// volume (saturates at `saturation_volume`), growth against the prior window,
    /// freshness, domain diversity (saturates at `saturation_domains`) and cohesion.
    pub fn potential_score(
        &self,
        volume: u32,
        prior_volume: u32,
        freshness_ratio: f64,
        source_diversity: u32,
        cohesion: Option<f64>,
    ) -> f64 {
        let w = &self.config.weights;
        let volume_score = (volume as f64 / self.config.saturation_volume as f64).min(1.0);
        let growth = growth_score(volume, prior_volume);
        let diversity = (source_diversity as f64 / self.config.saturation_domains as f64).min(1.0);
        let cohesion = cohesion.unwrap_or(0.0).clamp(0.0, 1.0);

        w.volume * volume_score
            + w.growth * growth
            + w.freshness * freshness_ratio.clamp(0.0, 1.0)
            + w.diversity * diversity
            + w.cohesion * cohesion
    }
}

/// 0.5 is flat, 1.0 is doubled or new, 0.0 is gone.
fn growth_score(volume: u32, prior: u32) -> f64 {
    if prior == 0 {
        return if volume > 0 { 1.0 } else { 0.0 };
    }
    let change = (volume as f64 - prior as f64) / prior as f64;
    (change.clamp(-1.0, 1.0) + 1.0) / 2.0
}
