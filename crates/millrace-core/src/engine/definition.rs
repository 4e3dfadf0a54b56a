//! Flow validation.
//!
//! Every nested scope (top level, catch list, parallel blocks, foreach
//! bodies) is checked before a run record exists, so a malformed flow never
//! reaches an adapter.

use millrace_types::flow::{Flow, Step, StepKind};

use super::dag::{ScopeGraph, ScopeKind};
use crate::adapter::AdapterRegistry;

/// Ids that would shadow template namespaces.
pub const RESERVED_IDS: &[&str] = &[
    "steps", "vars", "event", "trigger", "secrets", "run", "error", "catch",
];

/// Errors in a flow definition. Never retryable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DefinitionError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    Invalid(String),

    #[error("duplicate step id '{id}' in {scope}")]
    DuplicateId { id: String, scope: String },

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("malformed step: {0}")]
    MalformedStep(String),

    #[error("unknown tool '{tool}' referenced by step '{step}'")]
    UnknownTool { tool: String, step: String },
}

/// Validate a flow: ids, kinds, dependency graphs, and (when a registry is
/// given) tool references, for every nested scope.
pub fn validate_flow(flow: &Flow, registry: Option<&AdapterRegistry>) -> Result<(), DefinitionError> {
    if flow.name.trim().is_empty() {
        return Err(DefinitionError::Invalid(
            "flow name must not be empty".to_string(),
        ));
    }
    if flow.steps.is_empty() {
        return Err(DefinitionError::Invalid(
            "flow must have at least one step".to_string(),
        ));
    }

    validate_scope(&flow.steps, ScopeKind::Sequential, "flow", registry)?;
    if !flow.catch.is_empty() {
        validate_scope(&flow.catch, ScopeKind::Sequential, "catch", registry)?;
    }
    Ok(())
}

fn validate_scope(
    steps: &[Step],
    kind: ScopeKind,
    scope: &str,
    registry: Option<&AdapterRegistry>,
) -> Result<(), DefinitionError> {
    for step in steps {
        validate_id(&step.id)?;
    }

    // Duplicates, unknown dependencies and cycles.
    ScopeGraph::build(steps, kind).map_err(|e| match e {
        DefinitionError::DuplicateId { id, .. } => DefinitionError::DuplicateId {
            id,
            scope: scope.to_string(),
        },
        other => other,
    })?;

    for step in steps {
        let step_kind = step.kind().map_err(DefinitionError::MalformedStep)?;
        match step_kind {
            StepKind::Tool(tool) => check_tool(tool, &step.id, registry)?,
            StepKind::Parallel(children) => {
                validate_scope(
                    children,
                    ScopeKind::Parallel,
                    &format!("parallel block '{}'", step.id),
                    registry,
                )?;
            }
            StepKind::ForEach(spec) => {
                if spec.items.trim().is_empty() {
                    return Err(DefinitionError::MalformedStep(format!(
                        "foreach step '{}' has an empty items expression",
                        step.id
                    )));
                }
                if spec.concurrency == Some(0) {
                    return Err(DefinitionError::MalformedStep(format!(
                        "foreach step '{}' has concurrency 0",
                        step.id
                    )));
                }
                match &step.tool {
                    Some(tool) => check_tool(tool, &step.id, registry)?,
                    None => validate_scope(
                        &spec.steps,
                        ScopeKind::Sequential,
                        &format!("foreach body '{}'", step.id),
                        registry,
                    )?,
                }
            }
            StepKind::AwaitEvent(_) | StepKind::Wait(_) => {}
        }
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<(), DefinitionError> {
    if id.is_empty() {
        return Err(DefinitionError::MalformedStep(
            "step id must not be empty".to_string(),
        ));
    }
    // Paths are built from ids with '.' and '[n]'.
    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(DefinitionError::MalformedStep(format!(
            "step id '{id}' contains invalid characters (only alphanumeric, '-' and '_' allowed)"
        )));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(DefinitionError::MalformedStep(format!(
            "step id '{id}' is reserved"
        )));
    }
    Ok(())
}

fn check_tool(
    tool: &str,
    step: &str,
    registry: Option<&AdapterRegistry>,
) -> Result<(), DefinitionError> {
    match registry {
        Some(registry) if !registry.contains(tool) => Err(DefinitionError::UnknownTool {
            tool: tool.to_string(),
            step: step.to_string(),
        }),
        _ => Ok(()),
    }
}
