//! In-memory `RunRepository` backed by `DashMap`.
//!
//! Cloning the repository shares the underlying maps, so two engines built
//! from clones behave like two processes over one database.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use millrace_types::error::RepositoryError;
use millrace_types::run::{PausedRun, Run, RunFilter, StepRun};
use uuid::Uuid;

use super::run::RunRepository;

struct Lease {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    runs: DashMap<Uuid, Run>,
    leases: DashMap<Uuid, Lease>,
    steps: DashMap<Uuid, Vec<StepRun>>,
    paused: DashMap<String, PausedRun>,
    waits: DashMap<String, Vec<String>>,
}

/// Process-local run storage.
#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    tables: Arc<Tables>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_waits_for(&self, event: Option<&str>, token: &str) {
        if let Some(event) = event {
            if let Some(mut tokens) = self.tables.waits.get_mut(event) {
                tokens.retain(|t| t != token);
            }
        }
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn save_run(&self, run: &Run) -> Result<(), RepositoryError> {
        match self.tables.runs.entry(run.id) {
            Entry::Occupied(mut stored) => {
                let current = stored.get().state.revision;
                if current > run.state.revision {
                    return Err(RepositoryError::Conflict(format!(
                        "run {} is at revision {current}, snapshot has {}",
                        run.id, run.state.revision
                    )));
                }
                stored.insert(run.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
            }
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.tables.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, RepositoryError> {
        let mut runs: Vec<Run> = self
            .tables
            .runs
            .iter()
            .filter(|r| {
                filter
                    .flow_name
                    .as_deref()
                    .is_none_or(|name| r.flow_name == name)
                    && filter.status.is_none_or(|status| r.status == status)
            })
            .map(|r| r.value().clone())
            .collect();

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit as usize);
        }
        Ok(runs)
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let existed = self.tables.runs.remove(run_id).is_some();
        self.tables.steps.remove(run_id);
        self.tables.leases.remove(run_id);

        let tokens: Vec<String> = self
            .tables
            .paused
            .iter()
            .filter(|p| p.run_id == *run_id)
            .map(|p| p.token.clone())
            .collect();
        for token in tokens {
            if let Some((_, paused)) = self.tables.paused.remove(&token) {
                self.remove_waits_for(paused.event.as_deref(), &token);
            }
        }

        Ok(existed)
    }

    async fn acquire_lease(
        &self,
        run_id: &Uuid,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut lease = self
            .tables
            .leases
            .entry(*run_id)
            .or_insert(Lease { owner, expires_at });
        if lease.owner != owner && lease.expires_at >= now {
            return Ok(false);
        }
        *lease = Lease { owner, expires_at };
        Ok(true)
    }

    async fn release_lease(&self, run_id: &Uuid, owner: Uuid) -> Result<(), RepositoryError> {
        self.tables
            .leases
            .remove_if(run_id, |_, lease| lease.owner == owner);
        Ok(())
    }

    async fn save_step(&self, step: &StepRun) -> Result<(), RepositoryError> {
        let mut records = self.tables.steps.entry(step.run_id).or_default();
        match records
            .iter_mut()
            .find(|r| r.step_id == step.step_id && r.attempt == step.attempt)
        {
            Some(existing) => *existing = step.clone(),
            None => records.push(step.clone()),
        }
        Ok(())
    }

    async fn get_steps(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        Ok(self
            .tables
            .steps
            .get(run_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn save_paused_run(&self, paused: &PausedRun) -> Result<(), RepositoryError> {
        self.tables
            .paused
            .insert(paused.token.clone(), paused.clone());
        Ok(())
    }

    async fn get_paused_run(&self, token: &str) -> Result<Option<PausedRun>, RepositoryError> {
        Ok(self.tables.paused.get(token).map(|p| p.value().clone()))
    }

    async fn load_paused_runs(&self) -> Result<Vec<PausedRun>, RepositoryError> {
        let mut paused: Vec<PausedRun> = self
            .tables
            .paused
            .iter()
            .map(|p| p.value().clone())
            .collect();
        paused.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(paused)
    }

    async fn delete_paused_run(&self, token: &str) -> Result<bool, RepositoryError> {
        match self.tables.paused.remove(token) {
            Some((_, paused)) => {
                self.remove_waits_for(paused.event.as_deref(), token);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn register_wait(&self, event: &str, token: &str) -> Result<(), RepositoryError> {
        let mut tokens = self.tables.waits.entry(event.to_string()).or_default();
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
        Ok(())
    }

    async fn resolve_wait(&self, event: &str) -> Result<Vec<String>, RepositoryError> {
        Ok(self
            .tables
            .waits
            .get(event)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }
}
