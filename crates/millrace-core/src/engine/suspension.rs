//! Suspension tokens: persisting, claiming and expiring paused runs.
//!
//! A token moves ACTIVE -> SUSPENDED on `suspend` and leaves SUSPENDED
//! exactly once, through a successful claim (RESUMED) or an expiry
//! (EXPIRED). Both exits go through the repository's atomic delete, so when
//! several callers race on one token only one of them wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use millrace_types::run::{PauseKind, PausedRun};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::run::RunRepository;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SuspensionError {
    #[error("token not found: {0}")]
    TokenNotFound(String),

    #[error("payload does not match criteria for token {token}: field '{field}'")]
    CriteriaMismatch { token: String, field: String },

    #[error("token already in use: {0}")]
    TokenInUse(String),

    #[error("suspension repository error: {0}")]
    Repository(String),
}

/// Result of a claim that found a live token.
#[derive(Debug, Clone, PartialEq)]
pub enum Claimed {
    /// The token was consumed; continue the run.
    Resume(PausedRun),
    /// The deadline had already passed; the token was consumed as expired.
    Expired(PausedRun),
}

/// Owns the token lifecycle on top of `RunRepository`.
pub struct SuspensionManager<R: RunRepository> {
    repo: Arc<R>,
}

impl<R: RunRepository> SuspensionManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Persist a paused run and index it by event name.
    ///
    /// A token still held by another suspension is rejected rather than
    /// overwritten.
    pub async fn suspend(&self, paused: &PausedRun) -> Result<(), SuspensionError> {
        if self
            .repo
            .get_paused_run(&paused.token)
            .await
            .map_err(repo_err)?
            .is_some()
        {
            return Err(SuspensionError::TokenInUse(paused.token.clone()));
        }
        self.repo.save_paused_run(paused).await.map_err(repo_err)?;
        if let Some(event) = &paused.event {
            self.repo
                .register_wait(event, &paused.token)
                .await
                .map_err(repo_err)?;
        }
        tracing::info!(
            run_id = %paused.run_id,
            step = %paused.step_id,
            token = %paused.token,
            event = paused.event.as_deref().unwrap_or(""),
            due_at = ?paused.due_at,
            "run suspended"
        );
        Ok(())
    }

    /// Claim a token for resumption with `payload`.
    ///
    /// A payload that fails the criteria leaves the token untouched. A token
    /// past its deadline is consumed as expired. Losing a race on the atomic
    /// delete reports `TokenNotFound`.
    pub async fn claim(
        &self,
        token: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<Claimed, SuspensionError> {
        let paused = self
            .repo
            .get_paused_run(token)
            .await
            .map_err(repo_err)?
            .ok_or_else(|| SuspensionError::TokenNotFound(token.to_string()))?;

        let expired = paused.kind == PauseKind::Event && paused.is_due(now);
        if !expired {
            if let Err(field) = match_criteria(&paused.criteria, payload) {
                tracing::debug!(token, field = %field, "resume payload rejected");
                return Err(SuspensionError::CriteriaMismatch {
                    token: token.to_string(),
                    field,
                });
            }
        }

        if !self.repo.delete_paused_run(token).await.map_err(repo_err)? {
            return Err(SuspensionError::TokenNotFound(token.to_string()));
        }

        if expired {
            Ok(Claimed::Expired(paused))
        } else {
            Ok(Claimed::Resume(paused))
        }
    }

    /// Consume a token without checking criteria. `None` if it was already
    /// gone or another caller won the delete.
    pub async fn take(&self, token: &str) -> Result<Option<PausedRun>, SuspensionError> {
        let Some(paused) = self.repo.get_paused_run(token).await.map_err(repo_err)? else {
            return Ok(None);
        };
        if self.repo.delete_paused_run(token).await.map_err(repo_err)? {
            Ok(Some(paused))
        } else {
            Ok(None)
        }
    }

    /// Tokens registered for an event name.
    pub async fn waiting_on(&self, event: &str) -> Result<Vec<String>, SuspensionError> {
        self.repo.resolve_wait(event).await.map_err(repo_err)
    }

    /// Paused runs whose wake-up time or deadline has passed.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<PausedRun>, SuspensionError> {
        Ok(self
            .repo
            .load_paused_runs()
            .await
            .map_err(repo_err)?
            .into_iter()
            .filter(|p| p.is_due(now))
            .collect())
    }

    /// Delete every outstanding token of a run. Returns how many were removed.
    pub async fn cleanup_run(&self, run_id: Uuid) -> Result<usize, SuspensionError> {
        let tokens: Vec<String> = self
            .repo
            .load_paused_runs()
            .await
            .map_err(repo_err)?
            .into_iter()
            .filter(|p| p.run_id == run_id)
            .map(|p| p.token)
            .collect();

        let mut removed = 0;
        for token in tokens {
            if self.repo.delete_paused_run(&token).await.map_err(repo_err)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(run_id = %run_id, removed, "removed outstanding tokens");
        }
        Ok(removed)
    }
}

fn repo_err(e: millrace_types::error::RepositoryError) -> SuspensionError {
    SuspensionError::Repository(e.to_string())
}

/// Check every criteria entry against the payload. Keys may be dotted paths;
/// numeric segments index arrays. Returns the first mismatching key.
pub fn match_criteria(criteria: &Map<String, Value>, payload: &Value) -> Result<(), String> {
    for (path, expected) in criteria {
        let actual = lookup(payload, path);
        if !actual.is_some_and(|actual| values_equal(actual, expected)) {
            return Err(path.clone());
        }
    }
    Ok(())
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRunRepository;
    use chrono::Duration;
    use millrace_types::flow::TimeoutPolicy;
    use millrace_types::run::RunState;
    use serde_json::json;

    fn paused(token: &str, criteria: Value, due_at: Option<DateTime<Utc>>) -> PausedRun {
        PausedRun {
            token: token.to_string(),
            run_id: Uuid::now_v7(),
            step_id: "approval".to_string(),
            kind: PauseKind::Event,
            event: Some("approved".to_string()),
            criteria: criteria.as_object().cloned().unwrap_or_default(),
            due_at,
            on_timeout: TimeoutPolicy::Fail,
            state: RunState::default(),
            created_at: Utc::now(),
        }
    }

    fn manager() -> (SuspensionManager<InMemoryRunRepository>, Arc<InMemoryRunRepository>) {
        let repo = Arc::new(InMemoryRunRepository::new());
        (SuspensionManager::new(Arc::clone(&repo)), repo)
    }

    #[test]
    fn test_match_criteria_paths() {
        let payload = json!({ "order": { "id": 42, "items": ["a", "b"] }, "ok": true });
        let criteria = json!({ "order.id": 42, "order.items.1": "b", "ok": true });
        assert!(match_criteria(criteria.as_object().unwrap(), &payload).is_ok());

        let criteria = json!({ "order.id": 43 });
        assert_eq!(
            match_criteria(criteria.as_object().unwrap(), &payload),
            Err("order.id".to_string())
        );
        let criteria = json!({ "missing.field": null });
        assert!(match_criteria(criteria.as_object().unwrap(), &payload).is_err());
        assert!(match_criteria(&Map::new(), &Value::Null).is_ok());
    }

    #[tokio::test]
    async fn test_suspend_registers_wait() {
        let (manager, repo) = manager();
        manager.suspend(&paused("t1", json!({}), None)).await.unwrap();
        assert_eq!(repo.resolve_wait("approved").await.unwrap(), vec!["t1".to_string()]);
        assert_eq!(manager.waiting_on("approved").await.unwrap(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let (manager, _) = manager();
        manager.suspend(&paused("t1", json!({}), None)).await.unwrap();
        let err = manager.suspend(&paused("t1", json!({}), None)).await.unwrap_err();
        assert_eq!(err, SuspensionError::TokenInUse("t1".to_string()));
    }

    #[tokio::test]
    async fn test_claim_once() {
        let (manager, _) = manager();
        manager.suspend(&paused("t1", json!({}), None)).await.unwrap();

        let claimed = manager.claim("t1", &json!({}), Utc::now()).await.unwrap();
        assert!(matches!(claimed, Claimed::Resume(p) if p.token == "t1"));

        let err = manager.claim("t1", &json!({}), Utc::now()).await.unwrap_err();
        assert_eq!(err, SuspensionError::TokenNotFound("t1".to_string()));
    }

    #[tokio::test]
    async fn test_mismatch_leaves_token() {
        let (manager, repo) = manager();
        manager
            .suspend(&paused("t1", json!({ "decision": "yes" }), None))
            .await
            .unwrap();

        let err = manager
            .claim("t1", &json!({ "decision": "no" }), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SuspensionError::CriteriaMismatch { ref field, .. } if field == "decision"));
        assert!(repo.get_paused_run("t1").await.unwrap().is_some());

        assert!(manager
            .claim("t1", &json!({ "decision": "yes" }), Utc::now())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_claim_past_deadline_expires() {
        let (manager, repo) = manager();
        let deadline = Utc::now() - Duration::seconds(5);
        manager
            .suspend(&paused("t1", json!({ "decision": "yes" }), Some(deadline)))
            .await
            .unwrap();

        // Criteria are not consulted once the deadline passed.
        let claimed = manager.claim("t1", &json!({}), Utc::now()).await.unwrap();
        assert!(matches!(claimed, Claimed::Expired(_)));
        assert!(repo.get_paused_run("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        manager.suspend(&paused("race", json!({}), None)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.claim("race", &json!({}), Utc::now()).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, SuspensionError::TokenNotFound(_))),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_due_and_cleanup() {
        let (manager, repo) = manager();
        let now = Utc::now();
        let overdue = paused("late", json!({}), Some(now - Duration::seconds(1)));
        let pending = paused("later", json!({}), Some(now + Duration::hours(1)));
        let mut sibling = paused("sibling", json!({}), None);
        sibling.run_id = overdue.run_id;
        for p in [&overdue, &pending, &sibling] {
            manager.suspend(p).await.unwrap();
        }

        let due = manager.due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].token, "late");

        assert_eq!(manager.cleanup_run(overdue.run_id).await.unwrap(), 2);
        assert_eq!(repo.load_paused_runs().await.unwrap().len(), 1);
        assert!(manager.take("late").await.unwrap().is_none());
        assert!(manager.take("later").await.unwrap().is_some());
    }
}
