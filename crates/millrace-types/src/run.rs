//! Execution tracking types: runs, step records, and suspension tokens.
//!
//! `RunState` is the persisted continuation of a run. Everything the engine
//! needs to re-enter a run after a suspension -- in this process or another --
//! lives in it: variables, the current and original event, per-step statuses
//! and outputs, and the run-level error once one is recorded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::flow::{Flow, TimeoutPolicy};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Suspended on one or more await_event/wait steps.
    Waiting,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a step, both in `RunState` and on `StepRun` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Waiting,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Terminal and not failed: dependents may proceed.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

/// Which step list the run is currently executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Main,
    Catch,
}

// ---------------------------------------------------------------------------
// RunState (continuation)
// ---------------------------------------------------------------------------

/// Failure recorded on a run: message plus the path of the failing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Persisted per-step state inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Evaluated foreach collection, frozen at first evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
}

impl StepState {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            error: None,
            items: None,
        }
    }
}

/// The serializable continuation of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Incremented on every mutation; the newer of two copies wins on resume.
    pub revision: u64,
    #[serde(default)]
    pub phase: RunPhase,
    #[serde(default)]
    pub vars: Map<String, Value>,
    /// The current event: the trigger at start, the resume payload after.
    #[serde(default)]
    pub event: Value,
    /// The event that started the run.
    #[serde(default)]
    pub trigger: Value,
    /// Step states keyed by step path (`a`, `par.b`, `loop[2]`, `loop[2].b`).
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
    /// Step outputs keyed by step path. Append-only.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunState {
    pub fn new(vars: Map<String, Value>, trigger: Value) -> Self {
        Self {
            revision: 0,
            phase: RunPhase::Main,
            vars,
            event: trigger.clone(),
            trigger,
            steps: BTreeMap::new(),
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    pub fn status_of(&self, path: &str) -> Option<StepStatus> {
        self.steps.get(path).map(|s| s.status)
    }

    /// Set a step's status, keeping any frozen foreach items.
    pub fn set_status(&mut self, path: &str, status: StepStatus, error: Option<String>) {
        let entry = self
            .steps
            .entry(path.to_string())
            .or_insert_with(|| StepState::new(status));
        entry.status = status;
        entry.error = error;
        self.revision += 1;
    }

    /// Record a step's output and mark it succeeded.
    ///
    /// Returns `false` (leaving the existing value) if the path already has
    /// an output.
    pub fn record_output(&mut self, path: &str, output: Value) -> bool {
        let inserted = match self.outputs.entry(path.to_string()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(output);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        };
        self.set_status(path, StepStatus::Succeeded, None);
        inserted
    }

    /// Paths of every step currently waiting on a suspension.
    pub fn waiting_paths(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Waiting)
            .map(|(p, _)| p.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub flow_name: String,
    /// Snapshot of the definition the run executes.
    pub flow: Flow,
    pub status: RunStatus,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run with a fresh UUIDv7.
    pub fn new(flow: Flow, trigger_event: Value) -> Self {
        let now = Utc::now();
        let state = RunState::new(flow.vars.clone(), trigger_event);
        Self {
            id: Uuid::now_v7(),
            flow_name: flow.name.clone(),
            flow,
            status: RunStatus::Pending,
            state,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Failure message and failing step, once the run has failed.
    pub fn error(&self) -> Option<&RunError> {
        self.state.error.as_ref()
    }

    /// Output of a step by path, queryable even after the run failed.
    pub fn output(&self, path: &str) -> Option<&Value> {
        self.state.outputs.get(path)
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub flow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// StepRun
// ---------------------------------------------------------------------------

/// One execution record of a step. Retries append new attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Step path within the run.
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn started(run_id: Uuid, step_id: &str, attempt: u32, input: Option<Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id: step_id.to_string(),
            attempt,
            status: StepStatus::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Idempotency key: a record is unique per (run, step path, attempt).
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.run_id, self.step_id, self.attempt)
    }
}

// ---------------------------------------------------------------------------
// PausedRun
// ---------------------------------------------------------------------------

/// What a suspension is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    /// An external event; `due_at` is the optional deadline.
    Event,
    /// Elapsed time; `due_at` is the wake-up time.
    Timer,
}

/// One outstanding suspension, keyed by token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedRun {
    pub token: String,
    pub run_id: Uuid,
    /// Path of the suspended step.
    pub step_id: String,
    pub kind: PauseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Rendered field-equality predicates (dotted keys allowed).
    #[serde(default)]
    pub criteria: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Run state captured at the suspend point.
    pub state: RunState,
    pub created_at: DateTime<Utc>,
}

impl PausedRun {
    /// Whether the deadline (event) or wake-up time (timer) has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at.is_some_and(|due| due <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow() -> Flow {
        serde_json::from_value(json!({
            "name": "digest",
            "vars": { "limit": 5 },
            "steps": [{ "id": "a", "tool": "echo" }]
        }))
        .unwrap()
    }

    #[test]
    fn test_run_new_seeds_state() {
        let run = Run::new(flow(), json!({"user": "ada"}));
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.flow_name, "digest");
        assert_eq!(run.state.vars["limit"], json!(5));
        assert_eq!(run.state.event, json!({"user": "ada"}));
        assert_eq!(run.state.trigger, run.state.event);
        assert!(run.error().is_none());
    }

    #[test]
    fn test_run_status_serde() {
        assert_eq!(serde_json::to_value(RunStatus::TimedOut).unwrap(), json!("timed_out"));
        let parsed: RunStatus = serde_json::from_value(json!("waiting")).unwrap();
        assert_eq!(parsed, RunStatus::Waiting);
        assert_eq!(RunStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::TimedOut.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Waiting.is_terminal());
        assert!(StepStatus::Skipped.is_satisfied());
        assert!(!StepStatus::Failed.is_satisfied());
    }

    #[test]
    fn test_record_output_is_append_only() {
        let mut state = RunState::default();
        assert!(state.record_output("a", json!(1)));
        assert!(!state.record_output("a", json!(2)));
        assert_eq!(state.outputs["a"], json!(1));
        assert_eq!(state.status_of("a"), Some(StepStatus::Succeeded));
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn test_set_status_keeps_items() {
        let mut state = RunState::default();
        state.steps.insert(
            "loop".to_string(),
            StepState {
                status: StepStatus::Running,
                error: None,
                items: Some(vec![json!(1), json!(2)]),
            },
        );
        state.set_status("loop", StepStatus::Waiting, None);
        assert_eq!(state.steps["loop"].items.as_ref().unwrap().len(), 2);
        assert_eq!(state.waiting_paths(), vec!["loop"]);
    }

    #[test]
    fn test_paused_run_is_due() {
        let now = Utc::now();
        let mut paused = PausedRun {
            token: "t".to_string(),
            run_id: Uuid::now_v7(),
            step_id: "approval".to_string(),
            kind: PauseKind::Event,
            event: None,
            criteria: Map::new(),
            due_at: None,
            on_timeout: TimeoutPolicy::Fail,
            state: RunState::default(),
            created_at: now,
        };
        assert!(!paused.is_due(now));
        paused.due_at = Some(now - chrono::Duration::seconds(1));
        assert!(paused.is_due(now));
    }

    #[test]
    fn test_step_run_key() {
        let run_id = Uuid::now_v7();
        let rec = StepRun::started(run_id, "a", 2, None);
        assert_eq!(rec.key(), format!("{run_id}-a-2"));
        assert_eq!(rec.status, StepStatus::Running);
    }

    #[test]
    fn test_run_state_roundtrip() {
        let mut state = RunState::new(Map::new(), json!({"k": "v"}));
        state.record_output("par.b", json!({"x": 1}));
        state.phase = RunPhase::Catch;
        state.error = Some(RunError {
            message: "boom".to_string(),
            step_id: Some("par.b".to_string()),
        });
        let json = serde_json::to_string(&state).unwrap();
        let parsed: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
