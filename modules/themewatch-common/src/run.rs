//! Analysis run state machine.
//!
//! Each declared stage moves `pending -> running -> {completed | failed}`. A failed
//! stage with attempts left can be started again; completed stages are never re-run.
//! The run status is derived from the stage states, never stored independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ThemeWatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clustering,
    Temporal,
    Enrichment,
    GapAnalysis,
}

impl Stage {
    /// Stages whose outputs this stage reads.
    pub fn upstream(&self) -> &'static [Stage] {
        match self {
            Stage::Clustering => &[],
            Stage::Temporal => &[Stage::Clustering],
            Stage::Enrichment => &[Stage::Clustering, Stage::Temporal],
            Stage::GapAnalysis => &[Stage::Clustering, Stage::Temporal],
        }
    }

    /// External stages may exhaust their retries without failing the run.
    pub fn is_required(&self) -> bool {
        matches!(self, Stage::Clustering | Stage::Temporal)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Clustering => write!(f, "clustering"),
            Stage::Temporal => write!(f, "temporal"),
            Stage::Enrichment => write!(f, "enrichment"),
            Stage::GapAnalysis => write!(f, "gap_analysis"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: Stage,
    pub status: StageStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set by a non-retryable failure; `attempts` keeps the real count.
    #[serde(default)]
    pub exhausted: bool,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageState {
    fn new(stage: Stage, max_attempts: u32) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            attempts: 0,
            max_attempts,
            exhausted: false,
            last_error: None,
            error_kind: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Failed with no retry budget left.
    pub fn is_exhausted(&self) -> bool {
        self.status == StageStatus::Failed && (self.exhausted || self.attempts >= self.max_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    /// Every required stage completed, but an optional stage exhausted its
    /// retries or topic propagation diverged between the stores.
    Partial,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounts {
    pub documents: usize,
    pub clusters: usize,
    pub outliers: usize,
    pub potential_topics: usize,
    pub merge_suggestions: usize,
    pub assigned_in_vector_store: usize,
    pub assigned_in_relational_store: usize,
    pub propagation_errors: usize,
    pub temporal_metrics: usize,
}

impl RunCounts {
    pub fn propagation_diverged(&self) -> bool {
        self.propagation_errors > 0
            || self.assigned_in_vector_store != self.assigned_in_relational_store
    }
}

/// Durable handle callers poll for run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub scope: String,
    pub stages: Vec<StageState>,
    pub counts: RunCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRun {
    pub fn new(scope: &str, stages: &[Stage], max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope: scope.to_string(),
            stages: stages.iter().map(|s| StageState::new(*s, max_attempts)).collect(),
            counts: RunCounts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageState> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn stage_mut(&mut self, stage: Stage) -> Result<&mut StageState, ThemeWatchError> {
        self.stages
            .iter_mut()
            .find(|s| s.stage == stage)
            .ok_or_else(|| not_ready(stage, "stage is not declared for this run"))
    }

    pub fn is_declared(&self, stage: Stage) -> bool {
        self.stage(stage).is_some()
    }

    /// Check that `stage` may move to running: it is pending or retryable, and
    /// every declared upstream stage has completed.
    pub fn can_start(&self, stage: Stage) -> Result<(), ThemeWatchError> {
        let state = self
            .stage(stage)
            .ok_or_else(|| not_ready(stage, "stage is not declared for this run"))?;

        match state.status {
            StageStatus::Pending => {}
            StageStatus::Failed if !state.is_exhausted() => {}
            StageStatus::Failed => return Err(not_ready(stage, "retry budget exhausted")),
            StageStatus::Running => return Err(not_ready(stage, "already running")),
            StageStatus::Completed => return Err(not_ready(stage, "already completed")),
        }

        for upstream in stage.upstream() {
            if let Some(up) = self.stage(*upstream) {
                if up.status != StageStatus::Completed {
                    return Err(not_ready(stage, &format!("upstream stage {upstream} is not completed")));
                }
            }
        }
        Ok(())
    }

    pub fn start_stage(&mut self, stage: Stage) -> Result<(), ThemeWatchError> {
        self.can_start(stage)?;
        let now = Utc::now();
        let state = self.stage_mut(stage)?;
        state.status = StageStatus::Running;
        state.attempts += 1;
        state.started_at = Some(now);
        state.finished_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete_stage(&mut self, stage: Stage) -> Result<(), ThemeWatchError> {
        let now = Utc::now();
        let state = self.stage_mut(stage)?;
        if state.status != StageStatus::Running {
            return Err(not_ready(stage, "only a running stage can complete"));
        }
        state.status = StageStatus::Completed;
        state.last_error = None;
        state.error_kind = None;
        state.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a stage failure. Non-retryable errors exhaust the budget immediately.
    pub fn fail_stage(&mut self, stage: Stage, error: &ThemeWatchError) -> Result<(), ThemeWatchError> {
        let now = Utc::now();
        let state = self.stage_mut(stage)?;
        if state.status != StageStatus::Running {
            return Err(not_ready(stage, "only a running stage can fail"));
        }
        state.status = StageStatus::Failed;
        state.last_error = Some(error.to_string());
        state.error_kind = Some(error.kind().to_string());
        state.finished_at = Some(now);
        state.exhausted = !error.is_retryable();
        self.updated_at = now;
        Ok(())
    }

    /// Mark stages left `running` by a process that died mid-stage as failed
    /// attempts, so they can be retried. Returns the stages it touched.
    pub fn recover_interrupted(&mut self) -> Vec<Stage> {
        let interrupted: Vec<Stage> = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Running)
            .map(|s| s.stage)
            .collect();
        let error = ThemeWatchError::StoreUnavailable("stage interrupted before it finished".into());
        for stage in &interrupted {
            // Only running stages were collected, so this cannot be rejected.
            let _ = self.fail_stage(*stage, &error);
        }
        interrupted
    }

    /// First declared stage, in declaration order, that may start now.
    pub fn next_ready(&self) -> Option<Stage> {
        self.stages
            .iter()
            .map(|s| s.stage)
            .find(|stage| self.can_start(*stage).is_ok())
    }

    pub fn status(&self) -> RunStatus {
        if self
            .stages
            .iter()
            .any(|s| s.stage.is_required() && s.is_exhausted())
        {
            return RunStatus::Failed;
        }
        if self.stages.iter().all(|s| s.status == StageStatus::Pending) {
            return RunStatus::Pending;
        }
        let settled = self
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Completed || s.is_exhausted());
        if !settled {
            return RunStatus::Running;
        }
        let all_completed = self.stages.iter().all(|s| s.status == StageStatus::Completed);
        if all_completed && !self.counts.propagation_diverged() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed
        )
    }

    /// Kind of the most recent stage failure, if any.
    pub fn failure_kind(&self) -> Option<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
            .max_by_key(|s| s.finished_at)
            .and_then(|s| s.error_kind.as_deref())
    }
}

fn not_ready(stage: Stage, reason: &str) -> ThemeWatchError {
    ThemeWatchError::StageNotReady {
        stage: stage.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Stage; 4] = [Stage::Clustering, Stage::Temporal, Stage::Enrichment, Stage::GapAnalysis];

    fn retryable() -> ThemeWatchError {
        ThemeWatchError::StoreUnavailable("connection reset".into())
    }

    #[test]
    fn new_run_is_pending_and_clustering_is_ready() {
        let run = AnalysisRun::new("acme", &ALL, 3);
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.next_ready(), Some(Stage::Clustering));
    }

    #[test]
    fn stage_waits_for_upstream() {
        let mut run = AnalysisRun::new("acme", &ALL, 3);
        assert!(run.start_stage(Stage::Temporal).is_err());

        run.start_stage(Stage::Clustering).unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.start_stage(Stage::Temporal).is_err());

        run.complete_stage(Stage::Clustering).unwrap();
        assert_eq!(run.next_ready(), Some(Stage::Temporal));
        run.start_stage(Stage::Temporal).unwrap();
    }

    #[test]
    fn completed_stage_is_never_restarted() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering], 3);
        run.start_stage(Stage::Clustering).unwrap();
        run.complete_stage(Stage::Clustering).unwrap();
        assert!(matches!(
            run.start_stage(Stage::Clustering),
            Err(ThemeWatchError::StageNotReady { .. })
        ));
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[test]
    fn retryable_failure_can_restart_until_budget_exhausted() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering, Stage::Temporal], 2);

        run.start_stage(Stage::Clustering).unwrap();
        run.fail_stage(Stage::Clustering, &retryable()).unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(run.next_ready(), Some(Stage::Clustering));

        run.start_stage(Stage::Clustering).unwrap();
        run.fail_stage(Stage::Clustering, &retryable()).unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.next_ready(), None);
        assert_eq!(run.failure_kind(), Some("store_unavailable"));
    }

    #[test]
    fn non_retryable_failure_exhausts_immediately() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering], 3);
        run.start_stage(Stage::Clustering).unwrap();
        run.fail_stage(
            Stage::Clustering,
            &ThemeWatchError::InsufficientData { found: 15, required: 50 },
        )
        .unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.failure_kind(), Some("insufficient_data"));
        let state = run.stage(Stage::Clustering).unwrap();
        assert_eq!(state.attempts, 1);
        assert!(state.exhausted);
        assert_eq!(run.next_ready(), None);
    }

    #[test]
    fn exhausted_external_stage_leaves_run_partial_not_failed() {
        let mut run = AnalysisRun::new("acme", &ALL, 1);
        for stage in [Stage::Clustering, Stage::Temporal] {
            run.start_stage(stage).unwrap();
            run.complete_stage(stage).unwrap();
        }
        run.start_stage(Stage::Enrichment).unwrap();
        run.fail_stage(Stage::Enrichment, &retryable()).unwrap();

        // Gap analysis does not depend on enrichment.
        assert_eq!(run.next_ready(), Some(Stage::GapAnalysis));
        run.start_stage(Stage::GapAnalysis).unwrap();
        run.complete_stage(Stage::GapAnalysis).unwrap();

        assert_eq!(run.status(), RunStatus::Partial);
        assert!(run.is_terminal());
    }

    #[test]
    fn diverged_propagation_reports_partial() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering], 3);
        run.start_stage(Stage::Clustering).unwrap();
        run.complete_stage(Stage::Clustering).unwrap();
        run.counts.assigned_in_vector_store = 140;
        run.counts.assigned_in_relational_store = 150;
        run.counts.propagation_errors = 10;
        assert_eq!(run.status(), RunStatus::Partial);
    }

    #[test]
    fn interrupted_stage_becomes_retryable() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering, Stage::Temporal], 3);
        run.start_stage(Stage::Clustering).unwrap();
        assert_eq!(run.next_ready(), None);

        assert_eq!(run.recover_interrupted(), vec![Stage::Clustering]);
        let state = run.stage(Stage::Clustering).unwrap();
        assert_eq!(state.status, StageStatus::Failed);
        assert_eq!(state.attempts, 1);
        assert_eq!(run.next_ready(), Some(Stage::Clustering));
        assert!(run.recover_interrupted().is_empty());
    }

    #[test]
    fn complete_requires_running() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering], 3);
        assert!(run.complete_stage(Stage::Clustering).is_err());
        assert!(run.fail_stage(Stage::Clustering, &retryable()).is_err());
    }

    #[test]
    fn undeclared_stage_cannot_start() {
        let mut run = AnalysisRun::new("acme", &[Stage::Clustering, Stage::Temporal], 3);
        assert!(!run.is_declared(Stage::Enrichment));
        assert!(run.start_stage(Stage::Enrichment).is_err());
    }
}
