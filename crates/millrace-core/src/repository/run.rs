//! Run repository trait definition.
//!
//! The storage contract for runs, step execution records, suspension tokens
//! and event waits. Implementations must be safe to call concurrently from
//! many run coordinators and parallel branches.

use chrono::{DateTime, Utc};
use millrace_types::error::RepositoryError;
use millrace_types::run::{PausedRun, Run, RunFilter, StepRun};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Covers five entity families:
/// - **Runs:** upsert/query run records (status, flow snapshot, state).
/// - **Leases:** which engine currently coordinates a run.
/// - **Steps:** one record per (run, step path, attempt).
/// - **Paused runs:** suspension tokens with their captured state.
/// - **Waits:** event name -> token index for event routing.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert or replace a run record by ID.
    ///
    /// Fails with `Conflict` when the stored record has a newer
    /// `state.revision` than `run`, so a stale snapshot never overwrites
    /// progress made by another coordinator.
    fn save_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// List runs newest first.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    /// Delete a run with its step records, tokens and waits. Returns `true`
    /// if it existed.
    fn delete_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Take or extend the coordinator lease of a run until `expires_at`.
    ///
    /// Returns `true` when the run was unleased, already held by `owner`,
    /// or held by a lease that expired before `now`. At most one owner
    /// holds an unexpired lease at a time.
    fn acquire_lease(
        &self,
        run_id: &Uuid,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop the lease if `owner` still holds it.
    fn release_lease(
        &self,
        run_id: &Uuid,
        owner: Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or update a step record keyed by (run, step path, attempt).
    fn save_step(
        &self,
        step: &StepRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All step records of a run in the order they were first saved.
    fn get_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Paused runs
    // -----------------------------------------------------------------------

    fn save_paused_run(
        &self,
        paused: &PausedRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_paused_run(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<PausedRun>, RepositoryError>> + Send;

    /// Every outstanding suspension, across all runs.
    fn load_paused_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<PausedRun>, RepositoryError>> + Send;

    /// Atomically delete a token (and its waits). Exactly one concurrent
    /// caller observes `true`.
    fn delete_paused_run(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Waits
    // -----------------------------------------------------------------------

    /// Index a token under an event name.
    fn register_wait(
        &self,
        event: &str,
        token: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Tokens currently waiting on an event name, oldest first.
    fn resolve_wait(
        &self,
        event: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;
}
