//! Flow definition types.
//!
//! A `Flow` is the immutable, parsed representation of an automation. The
//! engine never mutates it: authoring formats (YAML, JSON, programmatic
//! builders) deserialize into these structs and hand them to the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// An automation definition: trigger, variables, ordered steps and an
/// optional catch list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Human-readable flow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// How the flow is meant to be started. Informational for the engine;
    /// front-ends use it to decide when to call `start_run`.
    #[serde(default)]
    pub trigger: Trigger,
    /// Flow-level variables, exposed to templates under `vars`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map<String, Value>,
    /// Secret names to resolve at run (re)entry, exposed under `secrets`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Ordered top-level steps.
    pub steps: Vec<Step>,
    /// Fallback steps executed when the run would otherwise terminate failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Step>,
}

/// How a flow is triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started explicitly by a caller.
    #[default]
    Manual,
    /// Started when a named external event arrives.
    Event { name: String },
    /// Started on a cron schedule.
    Schedule { cron: String },
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One node of the execution graph.
///
/// Exactly one of `tool`, `parallel`, `foreach`, `await_event` or `wait`
/// determines the step's kind. A `foreach` may carry its own `tool` (invoked
/// once per item) or a body of nested steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the enclosing scope.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool identifier resolved through the adapter registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Adapter input; strings may contain `{{ }}` templates.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub with: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Guard expression; a falsy result skips the step.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Children run concurrently, with no implicit ordering among them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<ForEach>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_event: Option<AwaitEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<Wait>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout for tool invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// The resolved kind of a step, borrowed from its definition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepKind<'a> {
    Tool(&'a str),
    Parallel(&'a [Step]),
    ForEach(&'a ForEach),
    AwaitEvent(&'a AwaitEvent),
    Wait(&'a Wait),
}

impl Step {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Resolve the step's kind, or describe why the definition is malformed.
    pub fn kind(&self) -> Result<StepKind<'_>, String> {
        let mut kinds = Vec::new();
        if !self.parallel.is_empty() {
            kinds.push("parallel");
        }
        if self.foreach.is_some() {
            kinds.push("foreach");
        }
        if self.await_event.is_some() {
            kinds.push("await_event");
        }
        if self.wait.is_some() {
            kinds.push("wait");
        }
        if self.tool.is_some() && self.foreach.is_none() {
            kinds.push("tool");
        }

        match kinds.as_slice() {
            [] => {
                return Err(format!(
                    "step '{}' must declare one of tool, parallel, foreach, await_event or wait",
                    self.id
                ));
            }
            [_] => {}
            many => {
                return Err(format!(
                    "step '{}' declares conflicting kinds: {}",
                    self.id,
                    many.join(", ")
                ));
            }
        }

        if let Some(foreach) = &self.foreach {
            return match (&self.tool, foreach.steps.is_empty()) {
                (Some(_), false) => Err(format!(
                    "foreach step '{}' cannot have both a tool and body steps",
                    self.id
                )),
                (None, true) => Err(format!(
                    "foreach step '{}' needs a tool or body steps",
                    self.id
                )),
                _ => Ok(StepKind::ForEach(foreach)),
            };
        }
        if !self.parallel.is_empty() {
            return Ok(StepKind::Parallel(&self.parallel));
        }
        if let Some(spec) = &self.await_event {
            return Ok(StepKind::AwaitEvent(spec));
        }
        if let Some(spec) = &self.wait {
            if spec.seconds.is_some() == spec.until.is_some() {
                return Err(format!(
                    "wait step '{}' needs exactly one of seconds or until",
                    self.id
                ));
            }
            return Ok(StepKind::Wait(spec));
        }
        match &self.tool {
            Some(tool) if !tool.trim().is_empty() => Ok(StepKind::Tool(tool)),
            _ => Err(format!("step '{}' has an empty tool reference", self.id)),
        }
    }

    /// Whether the step is a suspension point (await_event or wait).
    pub fn is_suspension(&self) -> bool {
        self.await_event.is_some() || self.wait.is_some()
    }
}

/// Iterate a collection, running a tool or a body once per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEach {
    /// Expression evaluated to the native collection (array, object or null).
    pub items: String,
    /// Loop-local binding name for the current element.
    #[serde(default = "default_item_binding", rename = "as")]
    pub binding: String,
    /// Maximum iterations in flight; sequential when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Body steps run as a sequential scope per element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

fn default_item_binding() -> String {
    "item".to_string()
}

/// Durable suspension until a matching external event arrives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwaitEvent {
    /// Event name used for `deliver_event` routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Token template; a fresh UUID is generated when unset or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Field-equality predicates the resuming payload must satisfy. Keys may
    /// be dotted paths; values may contain templates.
    #[serde(default, rename = "match", skip_serializing_if = "Map::is_empty")]
    pub criteria: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Overrides the engine's suspension timeout policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<TimeoutPolicy>,
}

/// Durable suspension until a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wait {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    /// RFC 3339 timestamp; may contain templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
}

/// What happens when an await_event deadline passes unmatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// The step fails; the run follows normal failure handling, catch included.
    #[default]
    Fail,
    /// The run ends with the distinct `timed_out` status; catch does not run.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retry policy for tool invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base delay between attempts.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Upper bound on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: 0,
            backoff: Backoff::default(),
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let millis = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        let millis = match self.max_delay_ms {
            Some(cap) => millis.min(cap),
            None => millis,
        };
        Duration::from_millis(millis)
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}
