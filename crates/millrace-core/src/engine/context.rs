//! Template context assembly.
//!
//! Builds the JSON object expressions evaluate against. Layers are applied
//! low to high so later layers shadow earlier ones:
//!
//! 1. resolved secrets
//! 2. flow vars
//! 3. fields of the current event
//! 4. step outputs by flat id (top-level ids, unambiguous nested ids, then
//!    siblings of each enclosing scope, innermost last)
//! 5. namespaces: `secrets`, `vars`, `event`, `trigger`, `steps`, `run`,
//!    `error`
//! 6. loop-local bindings
//!
//! Namespaces shadow same-named data keys. Step ids cannot collide with them
//! because they are listed in `definition::RESERVED_IDS`; keep the two lists
//! in step.

use std::collections::HashMap;

use millrace_types::run::RunState;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// The run-wide inputs for context assembly.
#[derive(Debug, Clone, Copy)]
pub struct RunView<'a> {
    pub run_id: Uuid,
    pub flow: &'a str,
    pub state: &'a RunState,
    pub secrets: &'a Map<String, Value>,
}

impl<'a> RunView<'a> {
    /// Build the context for an expression evaluated inside the scope whose
    /// step paths start with `prefix` (None for the top level).
    pub fn context(&self, prefix: Option<&str>, locals: &Map<String, Value>) -> Value {
        let state = self.state;
        let mut ctx = Map::new();

        for (k, v) in self.secrets {
            ctx.insert(k.clone(), v.clone());
        }
        for (k, v) in &state.vars {
            ctx.insert(k.clone(), v.clone());
        }
        if let Value::Object(fields) = &state.event {
            for (k, v) in fields {
                ctx.insert(k.clone(), v.clone());
            }
        }

        let flat = flat_outputs(state, prefix);
        for (k, v) in &flat {
            ctx.insert(k.clone(), v.clone());
        }

        ctx.insert("secrets".to_string(), Value::Object(self.secrets.clone()));
        ctx.insert("vars".to_string(), Value::Object(state.vars.clone()));
        ctx.insert("event".to_string(), state.event.clone());
        ctx.insert("trigger".to_string(), state.trigger.clone());
        ctx.insert("steps".to_string(), steps_namespace(state, flat));
        ctx.insert(
            "run".to_string(),
            json!({ "id": self.run_id.to_string(), "flow": self.flow }),
        );
        if let Some(error) = &state.error {
            ctx.insert(
                "error".to_string(),
                json!({ "message": error.message, "step_id": error.step_id }),
            );
        }

        for (k, v) in locals {
            ctx.insert(k.clone(), v.clone());
        }
        Value::Object(ctx)
    }
}

fn is_plain(segment: &str) -> bool {
    !segment.contains('.') && !segment.contains('[')
}

/// Outputs addressable by bare id from the given scope.
fn flat_outputs(state: &RunState, prefix: Option<&str>) -> Map<String, Value> {
    let mut flat = Map::new();

    // Nested `parent.child` paths, exposed as `child` only when exactly one
    // parent has such a child and no top-level step shares the id.
    let mut nested: HashMap<&str, Vec<&Value>> = HashMap::new();
    for (path, value) in &state.outputs {
        if let Some((parent, child)) = path.split_once('.') {
            if is_plain(parent) && is_plain(child) {
                nested.entry(child).or_default().push(value);
            }
        }
    }
    for (child, values) in nested {
        if values.len() == 1 && !state.outputs.contains_key(child) {
            flat.insert(child.to_string(), values[0].clone());
        }
    }

    for (path, value) in &state.outputs {
        if is_plain(path) {
            flat.insert(path.clone(), value.clone());
        }
    }

    if let Some(prefix) = prefix {
        for scope in enclosing_scopes(prefix) {
            let scoped = format!("{scope}.");
            for (path, value) in &state.outputs {
                if let Some(id) = path.strip_prefix(&scoped) {
                    if is_plain(id) {
                        flat.insert(id.to_string(), value.clone());
                    }
                }
            }
        }
    }

    flat
}

/// Every scope path enclosing `prefix`, outermost first, ending with
/// `prefix` itself. `loop[0].par` yields `loop[0]` then `loop[0].par`.
fn enclosing_scopes(prefix: &str) -> impl Iterator<Item = &str> {
    prefix
        .match_indices('.')
        .map(move |(at, _)| &prefix[..at])
        .chain(std::iter::once(prefix))
}

/// `steps` namespace: every output by full path, nested children folded into
/// their parent object when the parent has no output yet, plus flat ids.
fn steps_namespace(state: &RunState, flat: Map<String, Value>) -> Value {
    let mut steps = Map::new();
    for (path, value) in &state.outputs {
        steps.insert(path.clone(), value.clone());
    }

    for (path, value) in &state.outputs {
        let Some((parent, child)) = path.split_once('.') else {
            continue;
        };
        if !is_plain(parent) || !is_plain(child) || state.outputs.contains_key(parent) {
            continue;
        }
        let slot = steps
            .entry(parent.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(children) = slot {
            children.insert(child.to_string(), value.clone());
        }
    }

    for (id, value) in flat {
        steps.entry(id).or_insert(value);
    }
    Value::Object(steps)
}

/// Replace an oversized output with a marker object.
pub fn cap_output(step: &str, output: Value, max_bytes: usize) -> Value {
    let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
    if size <= max_bytes {
        return output;
    }
    tracing::warn!(
        step,
        size,
        max = max_bytes,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {max_bytes} byte limit and was truncated"),
    })
}
