//! Per-scope dependency graph and readiness tracking.
//!
//! Uses `petgraph` to model the steps of one scope as a directed graph.
//! Topological sort detects cycles at build time; at run time the scheduler
//! asks the graph which steps have every dependency satisfied.
//!
//! In a sequential scope a step without `depends_on` implicitly follows the
//! step declared before it. Parallel scopes have no implicit edges.

use std::collections::{HashMap, HashSet};

use millrace_types::flow::Step;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::DefinitionError;

/// Ordering rule applied to steps without explicit dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Top level, catch lists and foreach bodies.
    Sequential,
    /// Children of a parallel block.
    Parallel,
}

/// Resolved dependency edges for one scope, indexed by declaration order.
#[derive(Debug, Clone)]
pub struct ScopeGraph {
    ids: Vec<String>,
    deps: Vec<Vec<usize>>,
}

impl ScopeGraph {
    /// Build and validate the graph for one scope.
    ///
    /// Fails on duplicate ids, references to ids outside the scope, and
    /// cycles (including cycles formed with implicit sequential edges).
    pub fn build(steps: &[Step], kind: ScopeKind) -> Result<Self, DefinitionError> {
        let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if id_to_idx.insert(step.id.as_str(), i).is_some() {
                return Err(DefinitionError::DuplicateId {
                    id: step.id.clone(),
                    scope: String::new(),
                });
            }
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let mut edges = Vec::with_capacity(step.depends_on.len());
            for dep in &step.depends_on {
                let from = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                if !edges.contains(from) {
                    edges.push(*from);
                }
            }
            if edges.is_empty() && kind == ScopeKind::Sequential && i > 0 {
                edges.push(i - 1);
            }
            deps.push(edges);
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
        for (to, edges) in deps.iter().enumerate() {
            for &from in edges {
                graph.add_edge(nodes[from], nodes[to], ());
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            let node_id = graph[cycle.node_id()];
            DefinitionError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
        })?;

        Ok(Self {
            ids: steps.iter().map(|s| s.id.clone()).collect(),
            deps,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    /// Direct dependencies (explicit or implicit) of the step at `idx`.
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    /// Steps not yet started whose dependencies are all satisfied, in
    /// declaration order.
    pub fn ready(&self, satisfied: &HashSet<usize>, started: &HashSet<usize>) -> Vec<usize> {
        (0..self.ids.len())
            .filter(|i| !started.contains(i))
            .filter(|i| self.deps[*i].iter().all(|d| satisfied.contains(d)))
            .collect()
    }

    /// Transitive closure of every dependency of `step_id`.
    ///
    /// Returns an empty vec for unknown ids.
    pub fn transitive_dependencies(&self, step_id: &str) -> Vec<&str> {
        let Some(start) = self.ids.iter().position(|id| id == step_id) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for &dep in &self.deps[current] {
                if visited.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        let mut out: Vec<usize> = visited.into_iter().collect();
        out.sort_unstable();
        out.into_iter().map(|i| self.ids[i].as_str()).collect()
    }
}
