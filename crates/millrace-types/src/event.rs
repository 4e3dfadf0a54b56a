//! Lifecycle events published by the engine.
//!
//! Events are fire-and-forget notifications for observers (logs, UIs,
//! metrics). They are never used for control flow.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;

/// A run or step lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        flow: String,
    },
    StepStarted {
        run_id: Uuid,
        step: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: Uuid,
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step: String,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        run_id: Uuid,
        step: String,
    },
    RunSuspended {
        run_id: Uuid,
        step: String,
        token: String,
    },
    RunResumed {
        run_id: Uuid,
        step: String,
        token: String,
    },
    /// The run reached a terminal status.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::StepStarted { run_id, .. }
            | EngineEvent::StepCompleted { run_id, .. }
            | EngineEvent::StepFailed { run_id, .. }
            | EngineEvent::StepSkipped { run_id, .. }
            | EngineEvent::RunSuspended { run_id, .. }
            | EngineEvent::RunResumed { run_id, .. }
            | EngineEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagged_serialization() {
        let run_id = Uuid::nil();
        let event = EngineEvent::StepFailed {
            run_id,
            step: "fetch".to_string(),
            error: "boom".to_string(),
            will_retry: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("step_failed"));
        assert_eq!(value["will_retry"], json!(true));
        assert_eq!(event.run_id(), run_id);
    }

    #[test]
    fn test_run_finished_omits_empty_error() {
        let event = EngineEvent::RunFinished {
            run_id: Uuid::nil(),
            status: RunStatus::Succeeded,
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], json!("succeeded"));
        assert!(value.get("error").is_none());
    }
}
