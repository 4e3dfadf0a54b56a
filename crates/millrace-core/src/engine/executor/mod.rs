//! Run executor: drives runs to a terminal status or a durable suspension.
//!
//! `Engine` is the entry point for callers. Each call that advances a run
//! (start, resume, expiry, cancel) first claims the run: the in-process lock,
//! then the persisted coordinator lease, so at most one engine across all
//! processes sharing the repository drives a run at a time. It then rebuilds
//! a `RunHandle` from the freshly loaded record and hands it to `drive`,
//! which walks the flow's scopes (see `scope`) and re-checkpoints every
//! transition. A suspended run holds no task, no lock and no lease; it
//! exists only as its run record plus a paused-run token.

mod scope;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use millrace_types::config::EngineConfig;
use millrace_types::error::RepositoryError;
use millrace_types::event::EngineEvent;
use millrace_types::flow::{Flow, TimeoutPolicy};
use millrace_types::run::{
    PauseKind, PausedRun, Run, RunError, RunFilter, RunPhase, RunState, RunStatus, StepRun,
    StepStatus,
};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::RunView;
use super::definition::{validate_flow, DefinitionError};
use super::suspension::{Claimed, SuspensionError, SuspensionManager};
use super::template::{TemplateError, Templater};
use crate::adapter::{AdapterError, AdapterRegistry};
use crate::event::EventBus;
use crate::repository::run::RunRepository;
use crate::service::SecretResolver;

use scope::{Scope, ScopeOutcome};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by engine entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid flow: {0}")]
    Definition(#[from] DefinitionError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Suspension(#[from] SuspensionError),

    #[error(transparent)]
    Checkpoint(CheckpointError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl From<CheckpointError> for EngineError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => EngineError::Checkpoint(other),
        }
    }
}

/// Why a single step failed. Recorded as the step's error text and, when
/// unrecovered, as the run's error message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("suspension at step '{step}' timed out (token {token})")]
    SuspensionTimeout { step: String, token: String },

    #[error("{0}")]
    Invalid(String),
}

/// A run continued by `deliver_event`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub token: String,
    pub run_id: Uuid,
    pub status: RunStatus,
}

// ---------------------------------------------------------------------------
// Run handle
// ---------------------------------------------------------------------------

/// In-memory view of one run while it is being driven.
///
/// `state` is the single writer-serialized copy of the run's progress;
/// `record` guards persistence so snapshots reach storage in revision order.
pub(crate) struct RunHandle {
    run_id: Uuid,
    flow: Arc<Flow>,
    state: RwLock<RunState>,
    secrets: Map<String, Value>,
    cancel: CancellationToken,
    record: Mutex<Run>,
}

impl RunHandle {
    fn new(run: Run, secrets: Map<String, Value>, cancel: CancellationToken) -> Self {
        Self {
            run_id: run.id,
            flow: Arc::new(run.flow.clone()),
            state: RwLock::new(run.state.clone()),
            secrets,
            cancel,
            record: Mutex::new(run),
        }
    }

    /// Template context for an expression evaluated inside `prefix`.
    async fn context(&self, prefix: Option<&str>, locals: &Map<String, Value>) -> Value {
        let state = self.state.read().await;
        RunView {
            run_id: self.run_id,
            flow: &self.flow.name,
            state: &state,
            secrets: &self.secrets,
        }
        .context(prefix, locals)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct EngineInner<R: RunRepository> {
    repo: Arc<R>,
    checkpoint: CheckpointManager<R>,
    suspension: SuspensionManager<R>,
    adapters: AdapterRegistry,
    templater: Templater,
    secrets: SecretResolver,
    event_bus: EventBus,
    config: EngineConfig,
    limiter: Option<Arc<Semaphore>>,
    /// Cancellation tokens of runs currently being driven in this process.
    cancellations: DashMap<Uuid, CancellationToken>,
    /// Serializes continuations of the same run within this process.
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Owner id written into run leases taken by this engine.
    instance_id: Uuid,
}

/// Exclusive right to advance one run: the in-process lock plus the
/// persisted lease, renewed in the background until released.
struct RunClaim {
    run_id: Uuid,
    _guard: OwnedMutexGuard<()>,
    renewal: JoinHandle<()>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

/// The workflow engine. Cheap to clone; clones share all state.
pub struct Engine<R: RunRepository + 'static> {
    inner: Arc<EngineInner<R>>,
}

impl<R: RunRepository + 'static> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<R: RunRepository + 'static> {
    repo: R,
    adapters: AdapterRegistry,
    config: EngineConfig,
    secrets: SecretResolver,
    event_bus: Option<EventBus>,
}

impl<R: RunRepository + 'static> EngineBuilder<R> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn secrets(mut self, secrets: SecretResolver) -> Self {
        self.secrets = secrets;
        self
    }

    /// Share an existing bus instead of creating one from the config.
    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Engine<R> {
        let repo = Arc::new(self.repo);
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(self.config.event_bus_capacity));
        let limiter = self
            .config
            .max_concurrent_steps
            .map(|max| Arc::new(Semaphore::new(max.max(1))));

        Engine {
            inner: Arc::new(EngineInner {
                checkpoint: CheckpointManager::new(Arc::clone(&repo)),
                suspension: SuspensionManager::new(Arc::clone(&repo)),
                repo,
                adapters: self.adapters,
                templater: Templater::new(),
                secrets: self.secrets,
                event_bus,
                config: self.config,
                limiter,
                cancellations: DashMap::new(),
                run_locks: DashMap::new(),
                instance_id: Uuid::now_v7(),
            }),
        }
    }
}

impl<R: RunRepository + 'static> Engine<R> {
    pub fn builder(repo: R, adapters: AdapterRegistry) -> EngineBuilder<R> {
        EngineBuilder {
            repo,
            adapters,
            config: EngineConfig::default(),
            secrets: SecretResolver::default(),
            event_bus: None,
        }
    }

    pub fn new(repo: R, adapters: AdapterRegistry, config: EngineConfig) -> Self {
        Self::builder(repo, adapters).config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Owner id this engine writes into run leases.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Subscribe to run and step lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.event_bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Validate `flow`, create a run and drive it until it finishes or
    /// suspends. Invalid flows are rejected before any run record exists.
    #[tracing::instrument(skip_all, fields(flow = %flow.name))]
    pub async fn start_run(&self, flow: Flow, trigger: Value) -> Result<Run, EngineError> {
        validate_flow(&flow, Some(&self.inner.adapters))?;

        let mut run = Run::new(flow, trigger);
        run.status = RunStatus::Running;
        self.inner.checkpoint.save_run(&run).await?;

        let run_id = run.id;
        tracing::info!(run_id = %run_id, "run started");
        self.inner.event_bus.publish(EngineEvent::RunStarted {
            run_id,
            flow: run.flow_name.clone(),
        });

        let secrets = self.inner.secrets.resolve_all(&run.flow.secrets).await;
        let claim = self.inner.claim_run(run_id).await?;

        let handle = self.inner.activate(run, secrets);
        let driven = self.inner.drive(Arc::clone(&handle)).await;
        self.inner.release_run(claim).await;
        driven?;

        let run = handle.record.lock().await.clone();
        Ok(run)
    }

    /// Resume a suspended run with `payload`.
    ///
    /// Fails with `TokenNotFound` for unknown, already-consumed or expired
    /// tokens and with `CriteriaMismatch` (token kept) when the payload does
    /// not satisfy the step's match criteria.
    #[tracing::instrument(skip(self, payload))]
    pub async fn resume_run(&self, token: &str, payload: Value) -> Result<RunStatus, EngineError> {
        match self.inner.suspension.claim(token, &payload, Utc::now()).await? {
            Claimed::Resume(paused) => self.inner.continue_paused(paused, Ok(payload)).await,
            Claimed::Expired(paused) => {
                self.inner.expire(paused).await?;
                Err(SuspensionError::TokenNotFound(token.to_string()).into())
            }
        }
    }

    /// Resume every run waiting on `event` whose criteria match `payload`.
    #[tracing::instrument(skip(self, payload))]
    pub async fn deliver_event(
        &self,
        event: &str,
        payload: Value,
    ) -> Result<Vec<Delivery>, EngineError> {
        let tokens = self.inner.suspension.waiting_on(event).await?;
        let mut delivered = Vec::new();

        for token in tokens {
            match self.inner.suspension.claim(&token, &payload, Utc::now()).await {
                Ok(Claimed::Resume(paused)) => {
                    let run_id = paused.run_id;
                    let status = self.inner.continue_paused(paused, Ok(payload.clone())).await?;
                    delivered.push(Delivery {
                        token,
                        run_id,
                        status,
                    });
                }
                Ok(Claimed::Expired(paused)) => {
                    self.inner.expire(paused).await?;
                }
                Err(SuspensionError::TokenNotFound(_) | SuspensionError::CriteriaMismatch { .. }) => {
                    tracing::debug!(token = %token, "event not delivered to token");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(delivered = delivered.len(), "event delivered");
        Ok(delivered)
    }

    /// Expire a token now, applying its timeout policy.
    #[tracing::instrument(skip(self))]
    pub async fn expire_token(&self, token: &str) -> Result<RunStatus, EngineError> {
        let paused = self
            .inner
            .suspension
            .take(token)
            .await?
            .ok_or_else(|| SuspensionError::TokenNotFound(token.to_string()))?;
        self.inner.expire(paused).await
    }

    /// Resume due timers and expire overdue event tokens.
    ///
    /// Returns how many tokens were processed. Failures on one token are
    /// logged and do not stop the sweep.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self.inner.suspension.due(now).await?;
        let mut processed = 0;

        for candidate in due {
            let Some(paused) = self.inner.suspension.take(&candidate.token).await? else {
                continue;
            };
            let token = paused.token.clone();
            let result = match paused.kind {
                PauseKind::Timer => self.inner.continue_paused(paused, Ok(json!({}))).await,
                PauseKind::Event => self.inner.expire(paused).await,
            };
            match result {
                Ok(status) => {
                    processed += 1;
                    tracing::debug!(token = %token, status = %status, "processed due token");
                }
                Err(e) => {
                    tracing::error!(token = %token, error = %e, "failed to process due token");
                }
            }
        }
        Ok(processed)
    }

    /// Spawn the background task that calls `poll_due` every
    /// `sweep_interval_ms` until `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = period.as_millis() as u64, "sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.poll_due(Utc::now()).await {
                            tracing::warn!(error = %e, "sweep failed");
                        }
                    }
                }
            }
            tracing::info!("sweeper stopped");
        })
    }

    /// Cancel a run. In-flight adapters are aborted, outstanding tokens are
    /// removed and catch steps do not run. Terminal runs are left untouched.
    ///
    /// A run driven by another engine is cancelled once that engine releases
    /// it.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        if let Some(token) = self.inner.cancellations.get(&run_id) {
            token.cancel();
        }

        let run = self.inner.checkpoint.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }

        let claim = self.inner.claim_run(run_id).await?;
        let result = self.inner.cancel_claimed(run_id).await;
        self.inner.release_run(claim).await;
        result
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.inner.repo.get_run(&run_id).await?)
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        Ok(self.inner.checkpoint.load_run(run_id).await?.status)
    }

    /// Every step record of a run, attempts included, in execution order.
    pub async fn get_run_steps(&self, run_id: Uuid) -> Result<Vec<StepRun>, EngineError> {
        Ok(self.inner.repo.get_steps(&run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, EngineError> {
        Ok(self.inner.repo.list_runs(filter).await?)
    }

    /// Run every adapter's cleanup hook.
    pub async fn shutdown(&self) {
        for entry in self.inner.cancellations.iter() {
            entry.value().cancel();
        }
        self.inner.adapters.shutdown_all().await;
        tracing::info!("engine shut down");
    }
}

// ---------------------------------------------------------------------------
// Run coordination
// ---------------------------------------------------------------------------

impl<R: RunRepository + 'static> EngineInner<R> {
    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.run_locks.entry(run_id).or_default().value())
    }

    /// Drop the run's lock entry once nobody holds or waits on it.
    fn forget_run_lock(&self, run_id: Uuid) {
        self.run_locks
            .remove_if(&run_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.config.lease_ttl_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Take the run's lock and lease, polling while another engine holds the
    /// lease.
    async fn claim_run(self: &Arc<Self>, run_id: Uuid) -> Result<RunClaim, EngineError> {
        let guard = self.run_lock(run_id).lock_owned().await;
        if let Err(e) = self.wait_for_lease(run_id).await {
            drop(guard);
            self.forget_run_lock(run_id);
            return Err(e);
        }

        Ok(RunClaim {
            run_id,
            _guard: guard,
            renewal: self.spawn_lease_renewal(run_id),
        })
    }

    async fn wait_for_lease(&self, run_id: Uuid) -> Result<(), EngineError> {
        let poll = Duration::from_millis(self.config.lease_poll_ms.max(1));
        let mut waited = false;
        loop {
            let now = Utc::now();
            let acquired = self
                .repo
                .acquire_lease(&run_id, self.instance_id, self.lease_deadline(now), now)
                .await?;
            if acquired {
                if waited {
                    tracing::debug!(run_id = %run_id, "run lease acquired after wait");
                }
                return Ok(());
            }
            if !waited {
                tracing::debug!(run_id = %run_id, "run leased by another engine, waiting");
                waited = true;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn spawn_lease_renewal(self: &Arc<Self>, run_id: Uuid) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_millis((self.config.lease_ttl_ms / 3).max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let now = Utc::now();
                let renewed = engine
                    .repo
                    .acquire_lease(&run_id, engine.instance_id, engine.lease_deadline(now), now)
                    .await;
                match renewed {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(run_id = %run_id, "run lease taken over by another engine");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, error = %e, "failed to renew run lease");
                    }
                }
            }
        })
    }

    async fn release_run(&self, claim: RunClaim) {
        let run_id = claim.run_id;
        claim.renewal.abort();
        if let Err(e) = self.repo.release_lease(&run_id, self.instance_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to release run lease");
        }
        drop(claim);
        self.forget_run_lock(run_id);
    }

    /// Register a fresh cancellation token and build the handle.
    fn activate(&self, run: Run, secrets: Map<String, Value>) -> Arc<RunHandle> {
        let cancel = CancellationToken::new();
        self.cancellations.insert(run.id, cancel.clone());
        Arc::new(RunHandle::new(run, secrets, cancel))
    }

    /// Write the current state to the run record with `status`.
    async fn persist(&self, handle: &RunHandle, status: RunStatus) -> Result<(), EngineError> {
        // Hold the record lock while snapshotting so writes land in order.
        let mut record = handle.record.lock().await;
        record.state = handle.state.read().await.clone();
        record.status = status;
        record.updated_at = Utc::now();
        if status.is_terminal() && record.finished_at.is_none() {
            record.finished_at = Some(record.updated_at);
        }
        self.checkpoint.save_run(&record).await?;
        Ok(())
    }

    /// Walk the run from its persisted position to a terminal status or a
    /// suspension.
    async fn drive(self: &Arc<Self>, handle: Arc<RunHandle>) -> Result<RunStatus, EngineError> {
        let phase = handle.state.read().await.phase;
        let status = match phase {
            RunPhase::Main => {
                let root = Scope::root(handle.flow.steps.clone(), None);
                match self.run_scope(&handle, root).await {
                    ScopeOutcome::Completed => RunStatus::Succeeded,
                    ScopeOutcome::Suspended => RunStatus::Waiting,
                    ScopeOutcome::Cancelled => RunStatus::Cancelled,
                    ScopeOutcome::Failed { step, message } => {
                        self.fail_run(&handle, step, message).await?
                    }
                }
            }
            RunPhase::Catch => self.run_catch(&handle).await,
        };

        self.finish(&handle, status).await?;
        Ok(status)
    }

    /// Record the run error and dispatch the catch list if there is one.
    async fn fail_run(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        step: String,
        message: String,
    ) -> Result<RunStatus, EngineError> {
        tracing::warn!(run_id = %handle.run_id, step = %step, error = %message, "run failed");
        let has_catch = !handle.flow.catch.is_empty();
        {
            let mut state = handle.state.write().await;
            state.error = Some(RunError {
                message,
                step_id: Some(step),
            });
            if has_catch {
                state.phase = RunPhase::Catch;
            }
            state.revision += 1;
        }
        if !has_catch {
            return Ok(RunStatus::Failed);
        }

        self.persist(handle, RunStatus::Running).await?;
        Ok(self.run_catch(handle).await)
    }

    /// Catch steps never turn a failed run into a success.
    async fn run_catch(self: &Arc<Self>, handle: &Arc<RunHandle>) -> RunStatus {
        tracing::info!(run_id = %handle.run_id, "running catch steps");
        let scope = Scope::root(handle.flow.catch.clone(), Some("catch".to_string()));
        match self.run_scope(handle, scope).await {
            ScopeOutcome::Completed => RunStatus::Failed,
            ScopeOutcome::Failed { step, message } => {
                tracing::warn!(run_id = %handle.run_id, step = %step, error = %message, "catch step failed");
                RunStatus::Failed
            }
            ScopeOutcome::Suspended => RunStatus::Waiting,
            ScopeOutcome::Cancelled => RunStatus::Cancelled,
        }
    }

    /// Persist the outcome of a drive and release per-run resources.
    async fn finish(&self, handle: &RunHandle, status: RunStatus) -> Result<(), EngineError> {
        if status.is_terminal() {
            if let Err(e) = self.suspension.cleanup_run(handle.run_id).await {
                tracing::warn!(run_id = %handle.run_id, error = %e, "failed to remove outstanding tokens");
            }
        }
        self.persist(handle, status).await?;
        self.cancellations.remove(&handle.run_id);

        if status.is_terminal() {
            let error = handle
                .state
                .read()
                .await
                .error
                .as_ref()
                .map(|e| e.message.clone());
            tracing::info!(run_id = %handle.run_id, status = %status, "run finished");
            self.event_bus.publish(EngineEvent::RunFinished {
                run_id: handle.run_id,
                status,
                error,
            });
        } else {
            tracing::info!(run_id = %handle.run_id, status = %status, "run paused");
        }
        Ok(())
    }

    /// Continue a run whose token was consumed, either with the resuming
    /// payload or with the failure that ends the suspended step.
    async fn continue_paused(
        self: &Arc<Self>,
        paused: PausedRun,
        outcome: Result<Value, StepFailure>,
    ) -> Result<RunStatus, EngineError> {
        let claim = self.claim_run(paused.run_id).await?;
        let result = self.continue_claimed(paused, outcome).await;
        self.release_run(claim).await;
        result
    }

    /// Loaded only after the claim, so progress another engine made while
    /// this one waited is never lost.
    async fn continue_claimed(
        self: &Arc<Self>,
        paused: PausedRun,
        outcome: Result<Value, StepFailure>,
    ) -> Result<RunStatus, EngineError> {
        let mut run = self.checkpoint.load_run(paused.run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run.id, status = %run.status, "token consumed for finished run");
            return Ok(run.status);
        }
        // A crash between saving the token and the run record leaves the
        // token with the newer state.
        if paused.state.revision > run.state.revision {
            run.state = paused.state.clone();
        }

        let path = paused.step_id.as_str();
        match outcome {
            Ok(payload) => {
                if paused.kind == PauseKind::Event {
                    run.state.event = payload.clone();
                }
                if !run.state.record_output(path, payload.clone()) {
                    tracing::warn!(run_id = %run.id, step = path, "suspended step already had an output");
                }
                self.checkpoint
                    .step_resolved(run.id, path, Ok(payload))
                    .await?;
                tracing::info!(run_id = %run.id, step = path, token = %paused.token, "run resumed");
                self.event_bus.publish(EngineEvent::RunResumed {
                    run_id: run.id,
                    step: path.to_string(),
                    token: paused.token.clone(),
                });
            }
            Err(failure) => {
                let message = failure.to_string();
                run.state
                    .set_status(path, StepStatus::Failed, Some(message.clone()));
                self.checkpoint
                    .step_resolved(run.id, path, Err(message.clone()))
                    .await?;
                self.event_bus.publish(EngineEvent::StepFailed {
                    run_id: run.id,
                    step: path.to_string(),
                    error: message,
                    will_retry: false,
                });
            }
        }

        let secrets = self.secrets.resolve_all(&run.flow.secrets).await;
        let handle = self.activate(run, secrets);
        self.persist(&handle, RunStatus::Running).await?;
        self.drive(handle).await
    }

    /// Apply the timeout policy of an expired token.
    async fn expire(self: &Arc<Self>, paused: PausedRun) -> Result<RunStatus, EngineError> {
        tracing::warn!(
            run_id = %paused.run_id,
            step = %paused.step_id,
            token = %paused.token,
            policy = ?paused.on_timeout,
            "suspension deadline passed"
        );
        let failure = StepFailure::SuspensionTimeout {
            step: paused.step_id.clone(),
            token: paused.token.clone(),
        };

        match paused.on_timeout {
            TimeoutPolicy::Fail => self.continue_paused(paused, Err(failure)).await,
            TimeoutPolicy::TimedOut => {
                let claim = self.claim_run(paused.run_id).await?;
                let result = self.time_out_claimed(paused, failure).await;
                self.release_run(claim).await;
                result
            }
        }
    }

    /// End the run as timed out without running catch steps.
    async fn time_out_claimed(
        &self,
        paused: PausedRun,
        failure: StepFailure,
    ) -> Result<RunStatus, EngineError> {
        let mut run = self.checkpoint.load_run(paused.run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        if paused.state.revision > run.state.revision {
            run.state = paused.state.clone();
        }

        let message = failure.to_string();
        let path = paused.step_id.as_str();
        run.state
            .set_status(path, StepStatus::Failed, Some(message.clone()));
        run.state.error = Some(RunError {
            message: message.clone(),
            step_id: Some(path.to_string()),
        });
        self.checkpoint
            .step_resolved(run.id, path, Err(message.clone()))
            .await?;
        self.event_bus.publish(EngineEvent::StepFailed {
            run_id: run.id,
            step: path.to_string(),
            error: message,
            will_retry: false,
        });

        let handle = self.activate(run, Map::new());
        self.finish(&handle, RunStatus::TimedOut).await?;
        Ok(RunStatus::TimedOut)
    }

    /// Fail outstanding suspensions and mark the run cancelled.
    async fn cancel_claimed(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let mut run = self.checkpoint.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }

        let waiting: Vec<String> = run.state.waiting_paths().into_iter().map(String::from).collect();
        for path in &waiting {
            run.state
                .set_status(path, StepStatus::Failed, Some("cancelled".to_string()));
            self.checkpoint
                .step_resolved(run_id, path, Err("cancelled".to_string()))
                .await?;
        }

        let handle = self.activate(run, Map::new());
        self.finish(&handle, RunStatus::Cancelled).await?;
        Ok(RunStatus::Cancelled)
    }
}
