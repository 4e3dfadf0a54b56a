//! Scope scheduler and per-kind step dispatch.
//!
//! A scope is one list of sibling steps: the flow's top level, the catch
//! list, a parallel block's children or one foreach iteration's body. The
//! scheduler starts every step whose dependencies are satisfied, as soon as
//! they are satisfied, and settles on one `ScopeOutcome` once nothing more
//! can start. Scopes are re-entrant: statuses already recorded in
//! `RunState` are honored, so re-driving a resumed run continues exactly
//! where it stopped.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use millrace_types::event::EngineEvent;
use millrace_types::flow::{ForEach, RetryPolicy, Step, StepKind, TimeoutPolicy};
use millrace_types::run::{PauseKind, PausedRun, RunState, RunStatus, StepStatus};
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::{EngineError, EngineInner, RunHandle, StepFailure};
use crate::adapter::{AdapterContext, AdapterError, BoxAdapter};
use crate::engine::context::cap_output;
use crate::engine::dag::{ScopeGraph, ScopeKind};
use crate::engine::retry::{AttemptResult, RetryController, RetryOutcome};
use crate::engine::suspension::SuspensionError;
use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// One list of sibling steps and where it sits in the run.
pub(super) struct Scope {
    steps: Arc<Vec<Step>>,
    kind: ScopeKind,
    /// Path of the enclosing step; `None` for the top level.
    prefix: Option<String>,
    /// Loop bindings visible to every step in the scope.
    locals: Arc<Map<String, Value>>,
}

impl Scope {
    pub(super) fn root(steps: Vec<Step>, prefix: Option<String>) -> Self {
        Self {
            steps: Arc::new(steps),
            kind: ScopeKind::Sequential,
            prefix,
            locals: Arc::new(Map::new()),
        }
    }

    fn path(&self, id: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{id}"),
            None => id.to_string(),
        }
    }
}

/// How a scope settled.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum ScopeOutcome {
    Completed,
    /// At least one suspension point is waiting and nothing else can run.
    Suspended,
    /// `step` is the path of the step that failed first.
    Failed { step: String, message: String },
    Cancelled,
}

/// How a single step settled.
#[derive(Debug, Clone, PartialEq)]
enum StepOutcome {
    /// Succeeded or skipped; dependents may start.
    Done,
    Suspended,
    Failed { step: String, message: String },
    Cancelled,
}

/// Borrowed description of one tool invocation.
struct ToolCall<'a> {
    path: &'a str,
    tool: &'a str,
    with: &'a Value,
    retry: Option<&'a RetryPolicy>,
    timeout_secs: Option<u64>,
    prefix: Option<&'a str>,
    locals: &'a Map<String, Value>,
}

/// Rendered parameters of a suspension point.
struct SuspendPlan {
    token: String,
    kind: PauseKind,
    event: Option<String>,
    criteria: Map<String, Value>,
    due_at: Option<DateTime<Utc>>,
    on_timeout: TimeoutPolicy,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

impl<R: RunRepository + 'static> EngineInner<R> {
    /// Drive `scope` until every step has settled or nothing more can start.
    ///
    /// Boxed because container steps recurse into child scopes.
    pub(super) fn run_scope(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        scope: Scope,
    ) -> BoxFuture<'static, ScopeOutcome> {
        let engine = Arc::clone(self);
        let handle = Arc::clone(handle);
        Box::pin(async move { engine.schedule(handle, Arc::new(scope)).await })
    }

    async fn schedule(self: Arc<Self>, handle: Arc<RunHandle>, scope: Arc<Scope>) -> ScopeOutcome {
        let graph = match ScopeGraph::build(&scope.steps, scope.kind) {
            Ok(graph) => graph,
            Err(e) => {
                return ScopeOutcome::Failed {
                    step: scope.prefix.clone().unwrap_or_default(),
                    message: e.to_string(),
                };
            }
        };

        let mut satisfied = HashSet::new();
        let mut started = HashSet::new();
        let mut blocked = false;
        let mut failure: Option<(String, String)> = None;

        // Seed from recorded progress.
        {
            let state = handle.state.read().await;
            for idx in 0..graph.len() {
                let path = scope.path(graph.id(idx));
                let Some(entry) = state.steps.get(&path) else {
                    continue;
                };
                match entry.status {
                    status if status.is_satisfied() => {
                        satisfied.insert(idx);
                        started.insert(idx);
                    }
                    StepStatus::Failed => {
                        started.insert(idx);
                        failure.get_or_insert((path, entry.error.clone().unwrap_or_default()));
                    }
                    StepStatus::Waiting if scope.steps[idx].is_suspension() => {
                        started.insert(idx);
                        blocked = true;
                    }
                    // Containers re-enter their child scope. A tool left
                    // Running belongs to a coordinator whose lease lapsed,
                    // so it runs again.
                    _ => {}
                }
            }
        }

        let mut tasks: JoinSet<(usize, StepOutcome)> = JoinSet::new();
        loop {
            if failure.is_none() && !handle.cancel.is_cancelled() {
                for idx in graph.ready(&satisfied, &started) {
                    started.insert(idx);
                    let path = scope.path(graph.id(idx));
                    let engine = Arc::clone(&self);
                    let handle = Arc::clone(&handle);
                    let scope = Arc::clone(&scope);
                    tasks.spawn(async move {
                        let outcome = AssertUnwindSafe(engine.run_step(&handle, &scope, idx))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                tracing::error!(run_id = %handle.run_id, step = %path, "step panicked");
                                StepOutcome::Failed {
                                    step: path,
                                    message: "step panicked".to_string(),
                                }
                            });
                        (idx, outcome)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((idx, StepOutcome::Done)) => {
                    satisfied.insert(idx);
                }
                Ok((_, StepOutcome::Suspended)) => blocked = true,
                Ok((_, StepOutcome::Failed { step, message })) => {
                    failure.get_or_insert((step, message));
                }
                Ok((_, StepOutcome::Cancelled)) => {}
                Err(e) => {
                    failure.get_or_insert((
                        scope.prefix.clone().unwrap_or_default(),
                        format!("step task aborted: {e}"),
                    ));
                }
            }
        }

        if handle.cancel.is_cancelled() && satisfied.len() < graph.len() {
            ScopeOutcome::Cancelled
        } else if let Some((step, message)) = failure {
            ScopeOutcome::Failed { step, message }
        } else if blocked {
            ScopeOutcome::Suspended
        } else {
            ScopeOutcome::Completed
        }
    }

    async fn run_step(self: &Arc<Self>, handle: &Arc<RunHandle>, scope: &Scope, idx: usize) -> StepOutcome {
        let step = &scope.steps[idx];
        let path = scope.path(&step.id);
        match self.dispatch_step(handle, scope, step, &path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(run_id = %handle.run_id, step = %path, error = %e, "step bookkeeping failed");
                let message = e.to_string();
                handle
                    .state
                    .write()
                    .await
                    .set_status(&path, StepStatus::Failed, Some(message.clone()));
                StepOutcome::Failed { step: path, message }
            }
        }
    }

    async fn dispatch_step(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        scope: &Scope,
        step: &Step,
        path: &str,
    ) -> Result<StepOutcome, EngineError> {
        // The guard is evaluated once; re-entered containers skip it.
        let fresh = handle.state.read().await.status_of(path).is_none();
        if fresh {
            if let Some(condition) = &step.condition {
                let ctx = handle.context(scope.prefix.as_deref(), &scope.locals).await;
                match self.templater.evaluate_bool(condition, &ctx) {
                    Ok(true) => {}
                    Ok(false) => return self.skip_step(handle, path).await,
                    Err(e) => return self.fail_step(handle, path, e.into()).await,
                }
            }
        }

        let kind = match step.kind() {
            Ok(kind) => kind,
            Err(message) => return self.fail_step(handle, path, StepFailure::Invalid(message)).await,
        };

        match kind {
            StepKind::Tool(tool) => {
                let call = ToolCall {
                    path,
                    tool,
                    with: &step.with,
                    retry: step.retry.as_ref(),
                    timeout_secs: step.timeout_secs,
                    prefix: scope.prefix.as_deref(),
                    locals: &scope.locals,
                };
                self.invoke_tool(handle, call).await
            }
            StepKind::Parallel(children) => self.run_parallel(handle, scope, path, children).await,
            StepKind::ForEach(spec) => self.run_foreach(handle, scope, step, spec, path).await,
            StepKind::AwaitEvent(_) | StepKind::Wait(_) => {
                self.suspend_step(handle, scope, path, kind).await
            }
        }
    }

    async fn skip_step(&self, handle: &RunHandle, path: &str) -> Result<StepOutcome, EngineError> {
        tracing::debug!(run_id = %handle.run_id, step = path, "guard false, skipping step");
        self.checkpoint.step_skipped(handle.run_id, path).await?;
        handle
            .state
            .write()
            .await
            .set_status(path, StepStatus::Skipped, None);
        self.persist(handle, RunStatus::Running).await?;
        self.event_bus.publish(EngineEvent::StepSkipped {
            run_id: handle.run_id,
            step: path.to_string(),
        });
        Ok(StepOutcome::Done)
    }

    /// Fail a step before any attempt ran (bad template, unknown tool,
    /// malformed definition).
    async fn fail_step(
        &self,
        handle: &RunHandle,
        path: &str,
        failure: StepFailure,
    ) -> Result<StepOutcome, EngineError> {
        let message = failure.to_string();
        tracing::warn!(run_id = %handle.run_id, step = path, error = %message, "step failed");

        let mut record = self
            .checkpoint
            .step_started(handle.run_id, path, 1, None)
            .await?;
        self.checkpoint.step_failed(&mut record, &message).await?;
        handle
            .state
            .write()
            .await
            .set_status(path, StepStatus::Failed, Some(message.clone()));
        self.persist(handle, RunStatus::Running).await?;
        self.event_bus.publish(EngineEvent::StepFailed {
            run_id: handle.run_id,
            step: path.to_string(),
            error: message.clone(),
            will_retry: false,
        });
        Ok(StepOutcome::Failed {
            step: path.to_string(),
            message,
        })
    }

    // -----------------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------------

    async fn invoke_tool(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        call: ToolCall<'_>,
    ) -> Result<StepOutcome, EngineError> {
        let ctx = handle.context(call.prefix, call.locals).await;
        let input = match self.templater.render_value(call.with, &ctx) {
            Ok(input) => input,
            Err(e) => return self.fail_step(handle, call.path, e.into()).await,
        };
        let Some(adapter) = self.adapters.get(call.tool) else {
            let failure = AdapterError::UnknownTool(call.tool.to_string());
            return self.fail_step(handle, call.path, failure.into()).await;
        };

        handle
            .state
            .write()
            .await
            .set_status(call.path, StepStatus::Running, None);
        let started = Instant::now();

        let outcome = RetryController::run(call.retry, &handle.cancel, call.path, |attempt| {
            self.attempt(handle, &call, &adapter, &input, attempt)
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { output, attempts } => {
                handle.state.write().await.record_output(call.path, output);
                self.persist(handle, RunStatus::Running).await?;
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(run_id = %handle.run_id, step = call.path, attempts, duration_ms, "step completed");
                self.event_bus.publish(EngineEvent::StepCompleted {
                    run_id: handle.run_id,
                    step: call.path.to_string(),
                    duration_ms,
                });
                Ok(StepOutcome::Done)
            }
            RetryOutcome::Failed { error, attempts } => {
                tracing::warn!(run_id = %handle.run_id, step = call.path, attempts, error = %error, "step failed");
                handle
                    .state
                    .write()
                    .await
                    .set_status(call.path, StepStatus::Failed, Some(error.clone()));
                self.persist(handle, RunStatus::Running).await?;
                Ok(StepOutcome::Failed {
                    step: call.path.to_string(),
                    message: error,
                })
            }
            RetryOutcome::Cancelled { .. } => {
                handle.state.write().await.set_status(
                    call.path,
                    StepStatus::Failed,
                    Some("cancelled".to_string()),
                );
                Ok(StepOutcome::Cancelled)
            }
        }
    }

    /// One adapter invocation, recorded as its own `StepRun`.
    async fn attempt(
        &self,
        handle: &RunHandle,
        call: &ToolCall<'_>,
        adapter: &BoxAdapter,
        input: &Value,
        attempt: u32,
    ) -> AttemptResult {
        let _permit = match &self.limiter {
            Some(limiter) => tokio::select! {
                _ = handle.cancel.cancelled() => return AttemptResult::Cancelled,
                permit = Arc::clone(limiter).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        let mut record = match self
            .checkpoint
            .step_started(handle.run_id, call.path, attempt, Some(input.clone()))
            .await
        {
            Ok(record) => record,
            Err(e) => return AttemptResult::Err(e.to_string()),
        };
        self.event_bus.publish(EngineEvent::StepStarted {
            run_id: handle.run_id,
            step: call.path.to_string(),
            attempt,
        });

        let ctx = AdapterContext {
            run_id: handle.run_id,
            flow: handle.flow.name.clone(),
            step_id: call.path.to_string(),
            attempt,
            cancel: handle.cancel.child_token(),
        };
        let secs = call
            .timeout_secs
            .unwrap_or(self.config.default_step_timeout_secs);

        let result = tokio::select! {
            _ = handle.cancel.cancelled() => None,
            res = tokio::time::timeout(Duration::from_secs(secs), adapter.execute(&ctx, input.clone())) => {
                Some(res.unwrap_or(Err(AdapterError::Timeout(secs))))
            }
        };

        match result {
            None => {
                if let Err(e) = self.checkpoint.step_failed(&mut record, "cancelled").await {
                    tracing::warn!(step = call.path, error = %e, "failed to record cancelled attempt");
                }
                AttemptResult::Cancelled
            }
            Some(Ok(output)) => {
                let output = cap_output(call.path, output, self.config.max_step_output_bytes);
                if let Err(e) = self.checkpoint.step_succeeded(&mut record, output.clone()).await {
                    return AttemptResult::Err(e.to_string());
                }
                AttemptResult::Ok(output)
            }
            Some(Err(e)) => {
                let message = e.to_string();
                if let Err(e) = self.checkpoint.step_failed(&mut record, &message).await {
                    tracing::warn!(step = call.path, error = %e, "failed to record failed attempt");
                }
                self.event_bus.publish(EngineEvent::StepFailed {
                    run_id: handle.run_id,
                    step: call.path.to_string(),
                    error: message.clone(),
                    will_retry: RetryController::should_retry(call.retry, attempt),
                });
                AttemptResult::Err(message)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    /// Mark a container running, writing its record on first entry.
    async fn open_container(&self, handle: &RunHandle, path: &str) -> Result<Instant, EngineError> {
        let fresh = handle.state.read().await.status_of(path).is_none();
        if fresh {
            self.checkpoint
                .step_started(handle.run_id, path, 1, None)
                .await?;
            self.event_bus.publish(EngineEvent::StepStarted {
                run_id: handle.run_id,
                step: path.to_string(),
                attempt: 1,
            });
        }
        handle
            .state
            .write()
            .await
            .set_status(path, StepStatus::Running, None);
        Ok(Instant::now())
    }

    /// Settle a container from its child scope's outcome. `output` builds
    /// the aggregate from recorded child outputs on completion.
    async fn close_container(
        &self,
        handle: &RunHandle,
        path: &str,
        started: Instant,
        outcome: ScopeOutcome,
        output: impl FnOnce(&RunState) -> Value,
    ) -> Result<StepOutcome, EngineError> {
        match outcome {
            ScopeOutcome::Completed => {
                let output = {
                    let mut state = handle.state.write().await;
                    let output = cap_output(path, output(&state), self.config.max_step_output_bytes);
                    state.record_output(path, output.clone());
                    output
                };
                self.checkpoint
                    .step_resolved(handle.run_id, path, Ok(output))
                    .await?;
                self.persist(handle, RunStatus::Running).await?;
                self.event_bus.publish(EngineEvent::StepCompleted {
                    run_id: handle.run_id,
                    step: path.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(StepOutcome::Done)
            }
            ScopeOutcome::Suspended => {
                handle
                    .state
                    .write()
                    .await
                    .set_status(path, StepStatus::Waiting, None);
                self.persist(handle, RunStatus::Running).await?;
                Ok(StepOutcome::Suspended)
            }
            ScopeOutcome::Failed { step, message } => {
                handle
                    .state
                    .write()
                    .await
                    .set_status(path, StepStatus::Failed, Some(message.clone()));
                self.checkpoint
                    .step_resolved(handle.run_id, path, Err(message.clone()))
                    .await?;
                self.persist(handle, RunStatus::Running).await?;
                Ok(StepOutcome::Failed { step, message })
            }
            ScopeOutcome::Cancelled => {
                handle.state.write().await.set_status(
                    path,
                    StepStatus::Failed,
                    Some("cancelled".to_string()),
                );
                self.checkpoint
                    .step_resolved(handle.run_id, path, Err("cancelled".to_string()))
                    .await?;
                Ok(StepOutcome::Cancelled)
            }
        }
    }

    async fn run_parallel(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        scope: &Scope,
        path: &str,
        children: &[Step],
    ) -> Result<StepOutcome, EngineError> {
        let started = self.open_container(handle, path).await?;
        let child = Scope {
            steps: Arc::new(children.to_vec()),
            kind: ScopeKind::Parallel,
            prefix: Some(path.to_string()),
            locals: Arc::clone(&scope.locals),
        };
        let outcome = self.run_scope(handle, child).await;

        self.close_container(handle, path, started, outcome, |state| {
            let mut out = Map::new();
            for child in children {
                if let Some(value) = state.outputs.get(&format!("{path}.{}", child.id)) {
                    out.insert(child.id.clone(), value.clone());
                }
            }
            Value::Object(out)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Foreach
    // -----------------------------------------------------------------------

    async fn run_foreach(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        scope: &Scope,
        step: &Step,
        spec: &ForEach,
        path: &str,
    ) -> Result<StepOutcome, EngineError> {
        // The collection is evaluated once and frozen so a resumed loop
        // iterates the same elements.
        let frozen = handle
            .state
            .read()
            .await
            .steps
            .get(path)
            .and_then(|s| s.items.clone());
        let items = match frozen {
            Some(items) => items,
            None => {
                let ctx = handle.context(scope.prefix.as_deref(), &scope.locals).await;
                let evaluated = self
                    .templater
                    .evaluate(&spec.items, &ctx)
                    .map_err(StepFailure::from)
                    .and_then(collection_items);
                match evaluated {
                    Ok(items) => items,
                    Err(failure) => return self.fail_step(handle, path, failure).await,
                }
            }
        };

        let started = self.open_container(handle, path).await?;
        {
            let mut state = handle.state.write().await;
            if let Some(entry) = state.steps.get_mut(path) {
                if entry.items.is_none() {
                    entry.items = Some(items.clone());
                }
            }
            state.revision += 1;
        }
        self.persist(handle, RunStatus::Running).await?;

        let limit = spec.concurrency.unwrap_or(1).max(1);
        let pending: Vec<usize> = {
            let state = handle.state.read().await;
            (0..items.len())
                .filter(|i| {
                    !state
                        .status_of(&format!("{path}[{i}]"))
                        .is_some_and(|s| s.is_satisfied())
                })
                .collect()
        };
        tracing::debug!(run_id = %handle.run_id, step = path, items = items.len(), pending = pending.len(), limit, "running foreach");

        let mut pending = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut blocked = false;
        let mut failure: Option<(String, String)> = None;
        let mut cancelled = false;

        loop {
            while failure.is_none() && !handle.cancel.is_cancelled() && in_flight.len() < limit {
                let Some(index) = pending.next() else {
                    break;
                };
                in_flight.push(self.run_iteration(handle, scope, step, spec, path, index, &items[index]));
            }
            let Some(result) = in_flight.next().await else {
                break;
            };
            match result? {
                StepOutcome::Done => {}
                StepOutcome::Suspended => blocked = true,
                StepOutcome::Failed { step, message } => {
                    failure.get_or_insert((step, message));
                }
                StepOutcome::Cancelled => cancelled = true,
            }
        }

        let outcome = if cancelled || handle.cancel.is_cancelled() {
            ScopeOutcome::Cancelled
        } else if let Some((step, message)) = failure {
            ScopeOutcome::Failed { step, message }
        } else if blocked {
            ScopeOutcome::Suspended
        } else {
            ScopeOutcome::Completed
        };

        let count = items.len();
        self.close_container(handle, path, started, outcome, |state| {
            Value::Array(
                (0..count)
                    .map(|i| {
                        state
                            .outputs
                            .get(&format!("{path}[{i}]"))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect(),
            )
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        scope: &Scope,
        step: &Step,
        spec: &ForEach,
        path: &str,
        index: usize,
        item: &Value,
    ) -> Result<StepOutcome, EngineError> {
        let iteration = format!("{path}[{index}]");
        let mut locals = (*scope.locals).clone();
        locals.insert(spec.binding.clone(), item.clone());
        locals.insert("index".to_string(), json!(index));

        if let Some(tool) = &step.tool {
            let call = ToolCall {
                path: &iteration,
                tool,
                with: &step.with,
                retry: step.retry.as_ref(),
                timeout_secs: step.timeout_secs,
                prefix: scope.prefix.as_deref(),
                locals: &locals,
            };
            return self.invoke_tool(handle, call).await;
        }

        let body = Scope {
            steps: Arc::new(spec.steps.clone()),
            kind: ScopeKind::Sequential,
            prefix: Some(iteration.clone()),
            locals: Arc::new(locals),
        };
        match self.run_scope(handle, body).await {
            ScopeOutcome::Completed => {
                {
                    let mut state = handle.state.write().await;
                    let mut out = Map::new();
                    for child in &spec.steps {
                        if let Some(value) = state.outputs.get(&format!("{iteration}.{}", child.id)) {
                            out.insert(child.id.clone(), value.clone());
                        }
                    }
                    state.record_output(&iteration, Value::Object(out));
                }
                self.persist(handle, RunStatus::Running).await?;
                Ok(StepOutcome::Done)
            }
            ScopeOutcome::Suspended => Ok(StepOutcome::Suspended),
            ScopeOutcome::Failed { step, message } => {
                handle
                    .state
                    .write()
                    .await
                    .set_status(&iteration, StepStatus::Failed, Some(message.clone()));
                Ok(StepOutcome::Failed { step, message })
            }
            ScopeOutcome::Cancelled => Ok(StepOutcome::Cancelled),
        }
    }

    // -----------------------------------------------------------------------
    // Suspension points
    // -----------------------------------------------------------------------

    async fn suspend_step(
        &self,
        handle: &RunHandle,
        scope: &Scope,
        path: &str,
        kind: StepKind<'_>,
    ) -> Result<StepOutcome, EngineError> {
        let ctx = handle.context(scope.prefix.as_deref(), &scope.locals).await;
        let now = Utc::now();
        let plan = match self.plan_suspension(kind, &ctx, now) {
            Ok(plan) => plan,
            Err(failure) => return self.fail_step(handle, path, failure).await,
        };

        let snapshot = {
            let mut state = handle.state.write().await;
            state.set_status(path, StepStatus::Waiting, None);
            state.clone()
        };
        let paused = PausedRun {
            token: plan.token.clone(),
            run_id: handle.run_id,
            step_id: path.to_string(),
            kind: plan.kind,
            event: plan.event.clone(),
            criteria: plan.criteria,
            due_at: plan.due_at,
            on_timeout: plan.on_timeout,
            state: snapshot,
            created_at: now,
        };

        match self.suspension.suspend(&paused).await {
            Ok(()) => {}
            Err(SuspensionError::TokenInUse(token)) => {
                let failure = StepFailure::Invalid(format!("suspension token '{token}' is already in use"));
                return self.fail_step(handle, path, failure).await;
            }
            Err(e) => return Err(e.into()),
        }

        let input = json!({
            "token": plan.token,
            "event": plan.event,
            "due_at": plan.due_at,
        });
        self.checkpoint
            .step_waiting(handle.run_id, path, Some(input))
            .await?;
        self.persist(handle, RunStatus::Running).await?;
        self.event_bus.publish(EngineEvent::RunSuspended {
            run_id: handle.run_id,
            step: path.to_string(),
            token: plan.token,
        });
        Ok(StepOutcome::Suspended)
    }

    fn plan_suspension(
        &self,
        kind: StepKind<'_>,
        ctx: &Value,
        now: DateTime<Utc>,
    ) -> Result<SuspendPlan, StepFailure> {
        match kind {
            StepKind::AwaitEvent(spec) => {
                let token = match &spec.token {
                    Some(template) => self.templater.render(template, ctx)?,
                    None => String::new(),
                };
                let token = if token.trim().is_empty() {
                    Uuid::now_v7().to_string()
                } else {
                    token
                };
                let event = match &spec.event {
                    Some(template) => Some(self.templater.render(template, ctx)?).filter(|e| !e.is_empty()),
                    None => None,
                };
                let criteria = match self
                    .templater
                    .render_value(&Value::Object(spec.criteria.clone()), ctx)?
                {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let due_at = spec
                    .timeout_secs
                    .map(|secs| deadline(now, secs))
                    .transpose()?;

                Ok(SuspendPlan {
                    token,
                    kind: PauseKind::Event,
                    event,
                    criteria,
                    due_at,
                    on_timeout: spec
                        .on_timeout
                        .unwrap_or(self.config.suspension_timeout_policy),
                })
            }
            StepKind::Wait(spec) => {
                let due_at = match (spec.seconds, &spec.until) {
                    (Some(secs), _) => deadline(now, secs)?,
                    (None, Some(until)) => {
                        let rendered = self.templater.render(until, ctx)?;
                        DateTime::parse_from_rfc3339(rendered.trim())
                            .map(|at| at.with_timezone(&Utc))
                            .map_err(|e| {
                                StepFailure::Invalid(format!("invalid wait time '{rendered}': {e}"))
                            })?
                    }
                    (None, None) => {
                        return Err(StepFailure::Invalid(
                            "wait needs seconds or until".to_string(),
                        ));
                    }
                };
                Ok(SuspendPlan {
                    token: Uuid::now_v7().to_string(),
                    kind: PauseKind::Timer,
                    event: None,
                    criteria: Map::new(),
                    due_at: Some(due_at),
                    on_timeout: TimeoutPolicy::Fail,
                })
            }
            _ => Err(StepFailure::Invalid("not a suspension step".to_string())),
        }
    }
}

/// `now + secs`, rejecting offsets chrono cannot represent.
fn deadline(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, StepFailure> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|offset| now.checked_add_signed(offset))
        .ok_or_else(|| StepFailure::Invalid(format!("timeout of {secs}s is out of range")))
}

/// Elements a foreach iterates: array elements, `{key, value}` object
/// entries, or nothing for null.
fn collection_items(value: Value) -> Result<Vec<Value>, StepFailure> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(StepFailure::Invalid(format!(
            "foreach items must be an array, object or null, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_items() {
        assert_eq!(collection_items(json!([1, 2])).unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(
            collection_items(json!({ "a": 1 })).unwrap(),
            vec![json!({ "key": "a", "value": 1 })]
        );
        assert!(collection_items(Value::Null).unwrap().is_empty());
        let err = collection_items(json!("abc")).unwrap_err();
        assert!(err.to_string().contains("got string"));
    }

    #[test]
    fn test_deadline_out_of_range() {
        let now = Utc::now();
        assert_eq!(deadline(now, 60).unwrap(), now + chrono::Duration::seconds(60));
        assert!(deadline(now, u64::MAX).is_err());
    }

    #[test]
    fn test_scope_paths() {
        let root = Scope::root(Vec::new(), None);
        assert_eq!(root.path("a"), "a");
        let catch = Scope::root(Vec::new(), Some("catch".to_string()));
        assert_eq!(catch.path("alert"), "catch.alert");
    }
}
