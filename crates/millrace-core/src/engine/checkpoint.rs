//! Durable checkpoints for run and step state.
//!
//! Wraps `RunRepository` with a step-transition API. Every transition is
//! persisted before the executor moves on, so a run can be re-entered from
//! its last recorded state by any engine sharing the repository.

use std::sync::Arc;

use chrono::Utc;
use millrace_types::run::{Run, StepRun, StepStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Records step attempts and run snapshots.
///
/// Generic over `R: RunRepository` so the same executor runs on SQLite or
/// the in-memory store.
pub struct CheckpointManager<R: RunRepository> {
    repo: Arc<R>,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Record the start of an attempt. Each attempt is its own record.
    pub async fn step_started(
        &self,
        run_id: Uuid,
        path: &str,
        attempt: u32,
        input: Option<Value>,
    ) -> Result<StepRun, CheckpointError> {
        let record = StepRun::started(run_id, path, attempt, input);
        self.save_step(&record).await?;
        tracing::debug!(run_id = %run_id, step = path, attempt, "checkpointed step start");
        Ok(record)
    }

    pub async fn step_succeeded(
        &self,
        record: &mut StepRun,
        output: Value,
    ) -> Result<(), CheckpointError> {
        record.status = StepStatus::Succeeded;
        record.output = Some(output);
        record.error = None;
        record.finished_at = Some(Utc::now());
        self.save_step(record).await?;
        tracing::debug!(step = %record.step_id, attempt = record.attempt, "checkpointed step complete");
        Ok(())
    }

    pub async fn step_failed(&self, record: &mut StepRun, error: &str) -> Result<(), CheckpointError> {
        record.status = StepStatus::Failed;
        record.error = Some(error.to_string());
        record.finished_at = Some(Utc::now());
        self.save_step(record).await?;
        tracing::debug!(step = %record.step_id, attempt = record.attempt, error, "checkpointed step failed");
        Ok(())
    }

    /// Record a suspension point as waiting.
    pub async fn step_waiting(
        &self,
        run_id: Uuid,
        path: &str,
        input: Option<Value>,
    ) -> Result<StepRun, CheckpointError> {
        let mut record = StepRun::started(run_id, path, 1, input);
        record.status = StepStatus::Waiting;
        self.save_step(&record).await?;
        tracing::debug!(run_id = %run_id, step = path, "checkpointed step waiting");
        Ok(record)
    }

    /// Record a step whose guard evaluated false.
    pub async fn step_skipped(&self, run_id: Uuid, path: &str) -> Result<(), CheckpointError> {
        let mut record = StepRun::started(run_id, path, 1, None);
        record.status = StepStatus::Skipped;
        record.finished_at = Some(record.started_at);
        self.save_step(&record).await?;
        tracing::debug!(run_id = %run_id, step = path, "checkpointed step skipped");
        Ok(())
    }

    /// Close the open record (waiting suspension point or running container)
    /// at `path`.
    ///
    /// Updates the existing record in place when present so its start time
    /// is kept; otherwise writes a fresh one.
    pub async fn step_resolved(
        &self,
        run_id: Uuid,
        path: &str,
        outcome: Result<Value, String>,
    ) -> Result<(), CheckpointError> {
        let existing = self
            .repo
            .get_steps(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .into_iter()
            .rev()
            .find(|s| s.step_id == path && !s.status.is_terminal());
        let mut record = existing.unwrap_or_else(|| StepRun::started(run_id, path, 1, None));

        match outcome {
            Ok(output) => self.step_succeeded(&mut record, output).await,
            Err(error) => self.step_failed(&mut record, &error).await,
        }
    }

    async fn save_step(&self, record: &StepRun) -> Result<(), CheckpointError> {
        self.repo
            .save_step(record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist the run record (status plus state snapshot).
    pub async fn save_run(&self, run: &Run) -> Result<(), CheckpointError> {
        self.repo
            .save_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run.id,
            status = %run.status,
            revision = run.state.revision,
            "checkpointed run"
        );
        Ok(())
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<Run, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRunRepository;
    use serde_json::json;

    fn manager() -> (CheckpointManager<InMemoryRunRepository>, Arc<InMemoryRunRepository>) {
        let repo = Arc::new(InMemoryRunRepository::new());
        (CheckpointManager::new(Arc::clone(&repo)), repo)
    }

    #[tokio::test]
    async fn test_attempts_are_separate_records() {
        let (cp, repo) = manager();
        let run_id = Uuid::now_v7();

        let mut first = cp.step_started(run_id, "fetch", 1, Some(json!({}))).await.unwrap();
        cp.step_failed(&mut first, "timeout").await.unwrap();
        let mut second = cp.step_started(run_id, "fetch", 2, Some(json!({}))).await.unwrap();
        cp.step_succeeded(&mut second, json!({ "ok": true })).await.unwrap();

        let steps = repo.get_steps(&run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error.as_deref(), Some("timeout"));
        assert_eq!(steps[1].status, StepStatus::Succeeded);
        assert!(steps[1].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_skipped_record() {
        let (cp, repo) = manager();
        let run_id = Uuid::now_v7();
        cp.step_skipped(run_id, "notify").await.unwrap();
        let steps = repo.get_steps(&run_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_resolved_updates_waiting_record() {
        let (cp, repo) = manager();
        let run_id = Uuid::now_v7();
        let waiting = cp.step_waiting(run_id, "approval", None).await.unwrap();
        cp.step_resolved(run_id, "approval", Ok(json!({ "approved": true })))
            .await
            .unwrap();

        let steps = repo.get_steps(&run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, waiting.id);
        assert_eq!(steps[0].status, StepStatus::Succeeded);
        assert_eq!(steps[0].output, Some(json!({ "approved": true })));
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let (cp, _) = manager();
        let err = cp.load_run(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::RunNotFound(_)));
        assert!(err.to_string().contains("not found"));
    }
}
