//! Pipeline coordinator: drives one analysis run through its stages.
//!
//! Stages run in declaration order as soon as their upstream stages have
//! completed. A failed stage is retried in place until its attempt budget is
//! spent; completed stages are never re-run. The run record is saved after
//! every transition, so `resume` can pick an interrupted run back up from the
//! persisted clusters and metrics.
//!
//! One run per scope at a time: the scope lock is taken before the run record
//! is created and released when the coordinator returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use themewatch_common::{
    AnalysisRun, Cluster, DiscoveryConfig, Owner, Stage, TemporalMetric, ThemeWatchError,
};
use themewatch_store::{ArticleStore, RunStore, VectorIndex};

use crate::assignment::TopicAssignmentService;
use crate::cluster::ClusterEngine;
use crate::fetcher::{EmbeddingFetcher, FetchOutcome, FetchedCorpus, IncludePolicy};
use crate::labeler::TopicLabeler;
use crate::outliers::OutlierHandler;
use crate::summary::{cluster_summaries, partition_by_ownership};
use crate::temporal::TemporalMetricsEngine;
use crate::traits::{GapAnalyzer, TopicEnricher};

/// Artifact kinds saved alongside a run.
pub mod artifacts {
    pub const OUTLIER_SUMMARY: &str = "outlier_summary";
    pub const POTENTIAL_TOPICS: &str = "potential_topics";
    pub const MERGE_SUGGESTIONS: &str = "merge_suggestions";
    pub const ASSIGNMENT_ERRORS: &str = "assignment_errors";
    pub const INCLUDE_POLICY: &str = "include_policy";
}

/// Long-lived collaborators shared by every run.
#[derive(Clone, TypedBuilder)]
pub struct PipelineDeps {
    pub vectors: Arc<dyn VectorIndex>,
    pub articles: Arc<dyn ArticleStore>,
    pub runs: Arc<dyn RunStore>,
    #[builder(default)]
    pub enricher: Option<Arc<dyn TopicEnricher>>,
    #[builder(default)]
    pub gap_analyzer: Option<Arc<dyn GapAnalyzer>>,
    #[builder(default)]
    pub config: DiscoveryConfig,
    /// Checked between stages only.
    #[builder(default)]
    pub cancelled: Option<Arc<AtomicBool>>,
}

/// Stage inputs loaded so far in this process. Anything missing is reloaded
/// from the stores.
#[derive(Default)]
struct RunContext {
    policy: Option<IncludePolicy>,
    corpus: Option<FetchedCorpus>,
    clusters: Option<Vec<Cluster>>,
    metrics: Option<Vec<TemporalMetric>>,
}

pub struct PipelineCoordinator {
    deps: PipelineDeps,
}

impl PipelineCoordinator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    fn declared_stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Clustering, Stage::Temporal];
        if self.deps.enricher.is_some() {
            stages.push(Stage::Enrichment);
        }
        if self.deps.gap_analyzer.is_some() {
            stages.push(Stage::GapAnalysis);
        }
        stages
    }

    /// Start a new run for `scope` and drive it until it settles or is cancelled.
    ///
    /// Stage failures are recorded on the returned run, not returned as errors.
    /// Errors are reserved for an invalid configuration, a held scope lock,
    /// cancellation, and failures to persist the run record itself.
    pub async fn run(&self, scope: &str, policy: IncludePolicy) -> Result<AnalysisRun, ThemeWatchError> {
        self.deps.config.validate()?;
        self.with_scope_lock(scope, async {
            let policy = self.resolve_policy(scope, policy).await?;
            let run = AnalysisRun::new(
                scope,
                &self.declared_stages(),
                self.deps.config.pipeline.max_stage_attempts,
            );
            self.deps.runs.save_run(&run).await?;
            self.deps
                .runs
                .save_artifact(run.id, artifacts::INCLUDE_POLICY, to_json(&policy)?)
                .await?;
            info!(run_id = %run.id, scope, stages = ?self.declared_stages(), ?policy, "Analysis run created");

            let ctx = RunContext {
                policy: Some(policy),
                ..RunContext::default()
            };
            self.drive(run, ctx).await
        })
        .await
    }

    /// Continue a persisted run from its first unfinished stage.
    pub async fn resume(&self, run_id: Uuid) -> Result<AnalysisRun, ThemeWatchError> {
        self.deps.config.validate()?;
        let mut run = self
            .deps
            .runs
            .load_run(run_id)
            .await?
            .ok_or_else(|| ThemeWatchError::Validation(format!("run {run_id} not found")))?;
        if run.is_terminal() {
            info!(%run_id, status = %run.status(), "Run already settled, nothing to resume");
            return Ok(run);
        }

        let scope = run.scope.clone();
        self.with_scope_lock(&scope, async {
            info!(%run_id, scope = scope.as_str(), "Resuming analysis run");
            let interrupted = run.recover_interrupted();
            if !interrupted.is_empty() {
                warn!(%run_id, stages = ?interrupted, "Stages were interrupted mid-run, retrying them");
                self.deps.runs.save_run(&run).await?;
            }
            // Stage inputs are reloaded from the stores as stages need them.
            self.drive(run, RunContext::default()).await
        })
        .await
    }

    async fn with_scope_lock<F>(&self, scope: &str, body: F) -> Result<AnalysisRun, ThemeWatchError>
    where
        F: std::future::Future<Output = Result<AnalysisRun, ThemeWatchError>>,
    {
        let ttl = self.deps.config.pipeline.lock_ttl_minutes;
        if !self.deps.runs.acquire_scope_lock(scope, ttl).await? {
            warn!(scope, "Scope lock held by another run");
            return Err(ThemeWatchError::ScopeLocked(scope.to_string()));
        }

        let result = body.await;

        if let Err(e) = self.deps.runs.release_scope_lock(scope).await {
            warn!(scope, error = %e, "Failed to release scope lock, it will expire");
        }
        result
    }

    async fn resolve_policy(&self, scope: &str, policy: IncludePolicy) -> Result<IncludePolicy, ThemeWatchError> {
        if policy != IncludePolicy::SinceLastCompletedRun {
            return Ok(policy);
        }
        Ok(match self.deps.runs.last_finished_run(scope).await? {
            Some(previous) => {
                info!(scope, previous_run = %previous.id, since = %previous.created_at, "Incremental run");
                IncludePolicy::UnassignedOrSince(previous.created_at)
            }
            None => {
                info!(scope, "No finished run for scope, clustering everything");
                IncludePolicy::All
            }
        })
    }

    fn is_cancelled(&self) -> bool {
        self.deps
            .cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    async fn drive(&self, mut run: AnalysisRun, mut ctx: RunContext) -> Result<AnalysisRun, ThemeWatchError> {
        while let Some(stage) = run.next_ready() {
            if self.is_cancelled() {
                warn!(run_id = %run.id, %stage, "Run cancelled");
                self.deps.runs.save_run(&run).await?;
                return Err(ThemeWatchError::Cancelled {
                    run_id: run.id,
                    stage: stage.to_string(),
                });
            }

            run.start_stage(stage)?;
            self.deps.runs.save_run(&run).await?;
            let attempt = run.stage(stage).map(|s| s.attempts).unwrap_or_default();
            info!(run_id = %run.id, %stage, attempt, "Stage started");

            match self.execute(stage, &mut run, &mut ctx).await {
                Ok(()) => {
                    run.complete_stage(stage)?;
                    info!(run_id = %run.id, %stage, "Stage completed");
                }
                Err(e) => {
                    warn!(
                        run_id = %run.id,
                        %stage,
                        attempt,
                        kind = e.kind(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "Stage failed"
                    );
                    run.fail_stage(stage, &e)?;
                }
            }
            self.deps.runs.save_run(&run).await?;
        }

        info!(
            run_id = %run.id,
            scope = run.scope.as_str(),
            status = %run.status(),
            documents = run.counts.documents,
            clusters = run.counts.clusters,
            outliers = run.counts.outliers,
            temporal_metrics = run.counts.temporal_metrics,
            "Analysis run settled"
        );
        Ok(run)
    }

    async fn execute(&self, stage: Stage, run: &mut AnalysisRun, ctx: &mut RunContext) -> Result<(), ThemeWatchError> {
        match stage {
            Stage::Clustering => self.clustering_stage(run, ctx).await,
            Stage::Temporal => self.temporal_stage(run, ctx).await,
            Stage::Enrichment => self.enrichment_stage(run, ctx).await,
            Stage::GapAnalysis => self.gap_analysis_stage(run, ctx).await,
        }
    }

    /// Fetch, cluster, label, triage outliers, persist, then propagate topics.
    async fn clustering_stage(&self, run: &mut AnalysisRun, ctx: &mut RunContext) -> Result<(), ThemeWatchError> {
        let config = &self.deps.config;
        let policy = match ctx.policy.clone() {
            Some(policy) => policy,
            None => self.stored_policy(run.id).await?,
        };

        let fetcher = EmbeddingFetcher::new(self.deps.vectors.as_ref(), config.fetch.min_documents);
        let corpus = match fetcher.fetch(&Owner::ALL, &policy).await? {
            FetchOutcome::Ready(corpus) => corpus,
            FetchOutcome::InsufficientData { found, required } => {
                return Err(ThemeWatchError::InsufficientData { found, required });
            }
        };

        let engine = ClusterEngine::new(config.cluster_params_for(corpus.len()));
        let required = engine.params().min_documents;
        let (corpus, result) = tokio::task::spawn_blocking(move || {
            let result = engine.cluster(&corpus.texts, Some(corpus.embeddings.as_slice()));
            (corpus, result)
        })
        .await
        .map_err(|e| ThemeWatchError::ClusteringComputation(format!("clustering task aborted: {e}")))?;
        let mut result = result?;
        if !result.success {
            return Err(ThemeWatchError::InsufficientData {
                found: corpus.len(),
                required,
            });
        }
        result.attach_document_ids(&corpus.document_ids);

        let labeler = TopicLabeler::new(config.labeler.clone());
        labeler.label_clusters(&mut result.clusters, &corpus.texts, &corpus.embeddings);
        let merges = labeler.merge_similar_topics(&result.clusters);

        let outliers = OutlierHandler::new(config.outliers.clone()).handle(
            &result.labels,
            &corpus.document_ids,
            &corpus.texts,
            &corpus.embeddings,
            &result.clusters,
        )?;

        // Durable outputs first, so assignments never reference unsaved clusters.
        let runs = &self.deps.runs;
        runs.save_clusters(run.id, &result.clusters).await?;
        runs.save_artifact(run.id, artifacts::OUTLIER_SUMMARY, to_json(&outliers.summary)?).await?;
        runs.save_artifact(run.id, artifacts::POTENTIAL_TOPICS, to_json(&outliers.potential_topics)?)
            .await?;
        runs.save_artifact(run.id, artifacts::MERGE_SUGGESTIONS, to_json(&merges)?).await?;

        let assigner = TopicAssignmentService::new(
            self.deps.vectors.clone(),
            self.deps.articles.clone(),
            config.assignment.clone(),
        );
        let report = assigner
            .assign_topics_after_clustering(run.id, &result.labels, &corpus.document_ids, &run.scope)
            .await?;
        runs.save_artifact(run.id, artifacts::ASSIGNMENT_ERRORS, to_json(&report.errors)?).await?;
        if let Some(partial) = report.to_error() {
            warn!(run_id = %run.id, error = %partial, "Stores diverged after propagation");
        }

        let counts = &mut run.counts;
        counts.documents = corpus.len();
        counts.clusters = result.clusters.len();
        counts.outliers = outliers.summary.total;
        counts.potential_topics = outliers.potential_topics.len();
        counts.merge_suggestions = merges.len();
        counts.assigned_in_vector_store = report.assigned_in_vector_store;
        counts.assigned_in_relational_store = report.assigned_in_relational_store;
        counts.propagation_errors = report.errors.len();

        ctx.corpus = Some(corpus);
        ctx.clusters = Some(result.clusters);
        Ok(())
    }

    async fn temporal_stage(&self, run: &mut AnalysisRun, ctx: &mut RunContext) -> Result<(), ThemeWatchError> {
        let clusters = self.clusters(run.id, ctx).await?;
        let corpus = self.corpus(ctx).await?;

        let engine = TemporalMetricsEngine::new(self.deps.config.temporal.clone());
        let metrics = engine.compute(&clusters, &corpus, Utc::now());
        self.deps.runs.append_temporal_metrics(run.id, &metrics).await?;

        run.counts.temporal_metrics = metrics.len();
        ctx.metrics = Some(metrics);
        Ok(())
    }

    async fn enrichment_stage(&self, run: &mut AnalysisRun, ctx: &mut RunContext) -> Result<(), ThemeWatchError> {
        let Some(enricher) = self.deps.enricher.clone() else {
            return Ok(());
        };
        let clusters = self.clusters(run.id, ctx).await?;
        let metrics = self.metrics(run.id, ctx).await?;
        let summaries = cluster_summaries(&clusters, &metrics);
        enricher.enrich(run.id, &summaries).await
    }

    async fn gap_analysis_stage(&self, run: &mut AnalysisRun, ctx: &mut RunContext) -> Result<(), ThemeWatchError> {
        let Some(analyzer) = self.deps.gap_analyzer.clone() else {
            return Ok(());
        };
        let clusters = self.clusters(run.id, ctx).await?;
        let metrics = self.metrics(run.id, ctx).await?;
        let corpus = self.corpus(ctx).await?;
        let partitions = partition_by_ownership(&clusters, &metrics, &corpus);
        analyzer.analyze(run.id, &partitions).await
    }

    async fn stored_policy(&self, run_id: Uuid) -> Result<IncludePolicy, ThemeWatchError> {
        match self.deps.runs.load_artifact(run_id, artifacts::INCLUDE_POLICY).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| ThemeWatchError::Anyhow(e.into())),
            None => Ok(IncludePolicy::All),
        }
    }

    async fn clusters(&self, run_id: Uuid, ctx: &mut RunContext) -> Result<Vec<Cluster>, ThemeWatchError> {
        if let Some(clusters) = &ctx.clusters {
            return Ok(clusters.clone());
        }
        let clusters = self.deps.runs.load_clusters(run_id).await?;
        ctx.clusters = Some(clusters.clone());
        Ok(clusters)
    }

    async fn metrics(&self, run_id: Uuid, ctx: &mut RunContext) -> Result<Vec<TemporalMetric>, ThemeWatchError> {
        if let Some(metrics) = &ctx.metrics {
            return Ok(metrics.clone());
        }
        let metrics = self.deps.runs.load_temporal_metrics(run_id).await?;
        ctx.metrics = Some(metrics.clone());
        Ok(metrics)
    }

    /// The corpus for stages after clustering. Members are resolved by document
    /// id, so a resumed run reads every document regardless of the original policy.
    async fn corpus(&self, ctx: &mut RunContext) -> Result<FetchedCorpus, ThemeWatchError> {
        if let Some(corpus) = &ctx.corpus {
            return Ok(corpus.clone());
        }
        let corpus = EmbeddingFetcher::new(self.deps.vectors.as_ref(), 0)
            .fetch_all(&Owner::ALL, &IncludePolicy::All)
            .await?;
        ctx.corpus = Some(corpus.clone());
        Ok(corpus)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, ThemeWatchError> {
    serde_json::to_value(value).map_err(|e| ThemeWatchError::Anyhow(e.into()))
}
