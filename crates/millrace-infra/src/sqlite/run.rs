//! SQLite run repository.
//!
//! Implements `RunRepository` from `millrace-core` with sqlx over split
//! read/write pools. Flow snapshots, run state, step payloads and
//! suspension criteria are stored as JSON text; enums use their serde names.

use chrono::{DateTime, Utc};
use millrace_core::repository::run::RunRepository;
use millrace_types::error::RepositoryError;
use millrace_types::run::{PausedRun, Run, RunFilter, StepRun};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    status: String,
    flow: String,
    state: String,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            flow: row.try_get("flow")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let flow: millrace_types::flow::Flow = from_json(&self.flow, "flow")?;
        Ok(Run {
            id: parse_uuid(&self.id)?,
            flow_name: flow.name.clone(),
            flow,
            status: parse_enum(&self.status, "run status")?,
            state: from_json(&self.state, "run state")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    step_id: String,
    attempt: i64,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_step(self) -> Result<StepRun, RepositoryError> {
        Ok(StepRun {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            attempt: u32::try_from(self.attempt)
                .map_err(|_| RepositoryError::Query(format!("invalid attempt: {}", self.attempt)))?,
            status: parse_enum(&self.status, "step status")?,
            input: self
                .input
                .as_deref()
                .map(|s| from_json(s, "step input"))
                .transpose()?,
            output: self
                .output
                .as_deref()
                .map(|s| from_json(s, "step output"))
                .transpose()?,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

struct PausedRow {
    token: String,
    run_id: String,
    step_id: String,
    kind: String,
    event: Option<String>,
    criteria: String,
    due_at: Option<String>,
    on_timeout: String,
    state: String,
    created_at: String,
}

impl PausedRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            token: row.try_get("token")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            kind: row.try_get("kind")?,
            event: row.try_get("event")?,
            criteria: row.try_get("criteria")?,
            due_at: row.try_get("due_at")?,
            on_timeout: row.try_get("on_timeout")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_paused(self) -> Result<PausedRun, RepositoryError> {
        Ok(PausedRun {
            token: self.token,
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            kind: parse_enum(&self.kind, "pause kind")?,
            event: self.event,
            criteria: from_json(&self.criteria, "criteria")?,
            due_at: self.due_at.as_deref().map(parse_datetime).transpose()?,
            on_timeout: parse_enum(&self.on_timeout, "timeout policy")?,
            state: from_json(&self.state, "paused state")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

/// Serde name of a unit enum variant (`"timed_out"`, `"waiting"`).
fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("expected string enum, got {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn save_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let revision = i64::try_from(run.state.revision)
            .map_err(|_| RepositoryError::Query(format!("invalid revision: {}", run.state.revision)))?;

        // The update is skipped when the stored row is newer.
        let result = sqlx::query(
            r#"INSERT INTO runs (id, flow_name, status, flow, state, revision, created_at, updated_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 state = excluded.state,
                 revision = excluded.revision,
                 updated_at = excluded.updated_at,
                 finished_at = excluded.finished_at
               WHERE runs.revision <= excluded.revision"#,
        )
        .bind(run.id.to_string())
        .bind(&run.flow_name)
        .bind(enum_str(&run.status)?)
        .bind(to_json(&run.flow, "flow")?)
        .bind(to_json(&run.state, "run state")?)
        .bind(revision)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "run {} has a newer revision than {revision}",
                run.id
            )));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, RepositoryError> {
        let status = filter.status.as_ref().map(enum_str).transpose()?;
        // SQLite treats a negative LIMIT as no limit.
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            r#"SELECT * FROM runs
               WHERE (?1 IS NULL OR flow_name = ?1)
                 AND (?2 IS NULL OR status = ?2)
               ORDER BY created_at DESC, id DESC
               LIMIT ?3"#,
        )
        .bind(filter.flow_name.as_deref())
        .bind(status.as_deref())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_err)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        // Steps, paused runs and waits cascade.
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn acquire_lease(
        &self,
        run_id: &Uuid,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO run_leases (run_id, owner, expires_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(run_id) DO UPDATE SET
                 owner = excluded.owner,
                 expires_at = excluded.expires_at
               WHERE run_leases.owner = excluded.owner OR run_leases.expires_at < ?4"#,
        )
        .bind(run_id.to_string())
        .bind(owner.to_string())
        .bind(expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, run_id: &Uuid, owner: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM run_leases WHERE run_id = ? AND owner = ?")
            .bind(run_id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn save_step(&self, step: &StepRun) -> Result<(), RepositoryError> {
        let input = step.input.as_ref().map(|v| to_json(v, "step input")).transpose()?;
        let output = step.output.as_ref().map(|v| to_json(v, "step output")).transpose()?;

        sqlx::query(
            r#"INSERT INTO step_runs
               (id, run_id, step_id, attempt, status, input, output, error, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_id, attempt) DO UPDATE SET
                 status = excluded.status,
                 input = COALESCE(excluded.input, step_runs.input),
                 output = excluded.output,
                 error = excluded.error,
                 finished_at = excluded.finished_at"#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .bind(i64::from(step.attempt))
        .bind(enum_str(&step.status)?)
        .bind(&input)
        .bind(&output)
        .bind(&step.error)
        .bind(format_datetime(&step.started_at))
        .bind(step.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_steps(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_runs WHERE run_id = ? ORDER BY rowid ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_err)?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    async fn save_paused_run(&self, paused: &PausedRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO paused_runs
               (token, run_id, step_id, kind, event, criteria, due_at, on_timeout, state, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(token) DO UPDATE SET
                 run_id = excluded.run_id,
                 step_id = excluded.step_id,
                 kind = excluded.kind,
                 event = excluded.event,
                 criteria = excluded.criteria,
                 due_at = excluded.due_at,
                 on_timeout = excluded.on_timeout,
                 state = excluded.state"#,
        )
        .bind(&paused.token)
        .bind(paused.run_id.to_string())
        .bind(&paused.step_id)
        .bind(enum_str(&paused.kind)?)
        .bind(&paused.event)
        .bind(to_json(&paused.criteria, "criteria")?)
        .bind(paused.due_at.as_ref().map(format_datetime))
        .bind(enum_str(&paused.on_timeout)?)
        .bind(to_json(&paused.state, "paused state")?)
        .bind(format_datetime(&paused.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_paused_run(&self, token: &str) -> Result<Option<PausedRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM paused_runs WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = PausedRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_paused()?))
            }
            None => Ok(None),
        }
    }

    async fn load_paused_runs(&self) -> Result<Vec<PausedRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM paused_runs ORDER BY created_at ASC, rowid ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut paused = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = PausedRow::from_row(row).map_err(query_err)?;
            paused.push(r.into_paused()?);
        }
        Ok(paused)
    }

    async fn delete_paused_run(&self, token: &str) -> Result<bool, RepositoryError> {
        // Writes are serialized on the single writer connection, so exactly
        // one caller sees a row affected. Waits cascade.
        let result = sqlx::query("DELETE FROM paused_runs WHERE token = ?")
            .bind(token)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn register_wait(&self, event: &str, token: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO waits (event, token, created_at) VALUES (?, ?, ?) ON CONFLICT(event, token) DO NOTHING",
        )
        .bind(event)
        .bind(token)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn resolve_wait(&self, event: &str) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT token FROM waits WHERE event = ? ORDER BY created_at ASC, rowid ASC")
                .bind(event)
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;

        Ok(rows.into_iter().map(|(token,)| token).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_core::adapter::{Adapter, AdapterContext, AdapterError, AdapterRegistry};
    use millrace_core::engine::Engine;
    use millrace_types::config::EngineConfig;
    use millrace_types::flow::{Flow, TimeoutPolicy};
    use millrace_types::run::{PauseKind, RunState, RunStatus, StepStatus};
    use serde_json::{json, Map, Value};

    async fn test_repo() -> (SqliteRunRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (SqliteRunRepository::new(pool), dir)
    }

    fn sample_flow(name: &str) -> Flow {
        serde_json::from_value(json!({
            "name": name,
            "steps": [{ "id": "a", "tool": "echo" }]
        }))
        .unwrap()
    }

    fn sample_paused(run_id: Uuid, token: &str, event: Option<&str>) -> PausedRun {
        PausedRun {
            token: token.to_string(),
            run_id,
            step_id: "approval".to_string(),
            kind: PauseKind::Event,
            event: event.map(String::from),
            criteria: Map::from_iter([("user".to_string(), json!("ada"))]),
            due_at: Some(Utc::now()),
            on_timeout: TimeoutPolicy::TimedOut,
            state: RunState::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_update_run() {
        let (repo, _dir) = test_repo().await;
        let mut run = Run::new(sample_flow("digest"), json!({ "k": 1 }));
        repo.save_run(&run).await.unwrap();

        run.status = RunStatus::Succeeded;
        run.state.record_output("a", json!({ "ok": true }));
        run.finished_at = Some(Utc::now());
        repo.save_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert_eq!(loaded.flow, run.flow);
        assert_eq!(loaded.state, run.state);
        assert!(loaded.finished_at.is_some());
        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_run_snapshot_rejected() {
        let (repo, _dir) = test_repo().await;
        let stale = Run::new(sample_flow("digest"), Value::Null);
        let mut fresh = stale.clone();
        fresh.state.record_output("a", json!({ "ok": true }));
        repo.save_run(&fresh).await.unwrap();

        let err = repo.save_run(&stale).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        let loaded = repo.get_run(&fresh.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, fresh.state);
    }

    #[tokio::test]
    async fn test_lease_has_one_live_holder() {
        let (repo, _dir) = test_repo().await;
        let run = Run::new(sample_flow("leased"), Value::Null);
        repo.save_run(&run).await.unwrap();

        let (first, second) = (Uuid::now_v7(), Uuid::now_v7());
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        assert!(repo.acquire_lease(&run.id, first, later, now).await.unwrap());
        assert!(!repo.acquire_lease(&run.id, second, later, now).await.unwrap());
        assert!(repo.acquire_lease(&run.id, first, later, now).await.unwrap());

        let after_expiry = later + chrono::Duration::seconds(1);
        let renewed = after_expiry + chrono::Duration::seconds(30);
        assert!(repo
            .acquire_lease(&run.id, second, renewed, after_expiry)
            .await
            .unwrap());

        repo.release_lease(&run.id, first).await.unwrap();
        assert!(!repo.acquire_lease(&run.id, first, later, now).await.unwrap());
        repo.release_lease(&run.id, second).await.unwrap();
        assert!(repo.acquire_lease(&run.id, first, later, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_runs_filters() {
        let (repo, _dir) = test_repo().await;
        let mut first = Run::new(sample_flow("alpha"), Value::Null);
        first.status = RunStatus::Failed;
        let second = Run::new(sample_flow("alpha"), Value::Null);
        let third = Run::new(sample_flow("beta"), Value::Null);
        for run in [&first, &second, &third] {
            repo.save_run(run).await.unwrap();
        }

        let alpha = repo
            .list_runs(&RunFilter {
                flow_name: Some("alpha".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alpha.len(), 2);

        let failed = repo
            .list_runs(&RunFilter {
                status: Some(RunStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, first.id);

        let limited = repo
            .list_runs(&RunFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_step_records_upsert_by_attempt() {
        let (repo, _dir) = test_repo().await;
        let run = Run::new(sample_flow("steps"), Value::Null);
        repo.save_run(&run).await.unwrap();

        let mut first = StepRun::started(run.id, "a", 1, Some(json!({ "x": 1 })));
        repo.save_step(&first).await.unwrap();
        first.status = StepStatus::Failed;
        first.error = Some("boom".to_string());
        repo.save_step(&first).await.unwrap();
        let second = StepRun::started(run.id, "a", 2, None);
        repo.save_step(&second).await.unwrap();

        let steps = repo.get_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].attempt, 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].input, Some(json!({ "x": 1 })));
        assert_eq!(steps[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_paused_run_roundtrip_and_waits() {
        let (repo, _dir) = test_repo().await;
        let run = Run::new(sample_flow("paused"), Value::Null);
        repo.save_run(&run).await.unwrap();

        let paused = sample_paused(run.id, "tok-1", Some("approved"));
        repo.save_paused_run(&paused).await.unwrap();
        repo.register_wait("approved", "tok-1").await.unwrap();
        repo.register_wait("approved", "tok-1").await.unwrap();

        let loaded = repo.get_paused_run("tok-1").await.unwrap().unwrap();
        assert_eq!(loaded.on_timeout, TimeoutPolicy::TimedOut);
        assert_eq!(loaded.criteria["user"], json!("ada"));
        assert_eq!(repo.resolve_wait("approved").await.unwrap(), vec!["tok-1"]);
        assert_eq!(repo.load_paused_runs().await.unwrap().len(), 1);

        assert!(repo.delete_paused_run("tok-1").await.unwrap());
        assert!(!repo.delete_paused_run("tok-1").await.unwrap());
        assert!(repo.resolve_wait("approved").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_delete_has_one_winner() {
        let (repo, _dir) = test_repo().await;
        let run = Run::new(sample_flow("race"), Value::Null);
        repo.save_run(&run).await.unwrap();
        repo.save_paused_run(&sample_paused(run.id, "contested", None))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.delete_paused_run("contested").await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_run_cascades() {
        let (repo, _dir) = test_repo().await;
        let run = Run::new(sample_flow("gone"), Value::Null);
        repo.save_run(&run).await.unwrap();
        repo.save_step(&StepRun::started(run.id, "a", 1, None))
            .await
            .unwrap();
        repo.save_paused_run(&sample_paused(run.id, "tok", Some("evt")))
            .await
            .unwrap();
        repo.register_wait("evt", "tok").await.unwrap();

        assert!(repo.delete_run(&run.id).await.unwrap());
        assert!(repo.get_steps(&run.id).await.unwrap().is_empty());
        assert!(repo.get_paused_run("tok").await.unwrap().is_none());
        assert!(repo.resolve_wait("evt").await.unwrap().is_empty());
        assert!(!repo.delete_run(&run.id).await.unwrap());
    }

    struct Echo;

    impl Adapter for Echo {
        async fn execute(&self, _ctx: &AdapterContext, input: Value) -> Result<Value, AdapterError> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_engine_resumes_run_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let flow: Flow = serde_json::from_value(json!({
            "name": "approval",
            "steps": [
                { "id": "ask", "tool": "echo", "with": { "q": "ship it?" } },
                { "id": "approval", "await_event": { "event": "approved", "token": "ship-{{ release }}" } },
                { "id": "done", "tool": "echo", "with": { "by": "{{ approval.user }}" } }
            ]
        }))
        .unwrap();

        let run_id = {
            let pool = DatabasePool::open_in(dir.path()).await.unwrap();
            let engine = Engine::new(
                SqliteRunRepository::new(pool),
                AdapterRegistry::new().with("echo", Echo),
                EngineConfig::default(),
            );
            let run = engine
                .start_run(flow, json!({ "release": "1.2" }))
                .await
                .unwrap();
            assert_eq!(run.status, RunStatus::Waiting);
            run.id
        };

        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        let engine = Engine::new(
            SqliteRunRepository::new(pool),
            AdapterRegistry::new().with("echo", Echo),
            EngineConfig::default(),
        );
        let delivered = engine
            .deliver_event("approved", json!({ "user": "grace" }))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].token, "ship-1.2");
        assert_eq!(delivered[0].status, RunStatus::Succeeded);

        let run = engine.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.output("done"), Some(&json!({ "by": "grace" })));
        let steps = engine.get_run_steps(run_id).await.unwrap();
        assert_eq!(steps.iter().filter(|s| s.step_id == "ask").count(), 1);
    }
}
