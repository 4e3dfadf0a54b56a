//! Adapter contract: the uniform capability interface a step's tool resolves to.
//!
//! - `Adapter` -- native async trait (RPITIT) that tool implementations provide
//! - `BoxAdapter` -- object-safe wrapper for runtime dispatch
//! - `AdapterRegistry` -- tool id -> adapter lookup injected into the engine
//!
//! The engine never branches on tool identity; everything it knows about a
//! tool is this interface.

pub mod box_adapter;
pub mod registry;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use box_adapter::BoxAdapter;
pub use registry::AdapterRegistry;

/// Per-invocation information handed to an adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub flow: String,
    /// Path of the invoking step within the run.
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run is cancelled; long-running adapters should
    /// observe it. The engine also drops the invocation future on cancel.
    pub cancel: CancellationToken,
}

/// Errors returned by adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    /// The tool ran and failed. The message is surfaced verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("step timed out after {0}s")]
    Timeout(u64),

    #[error("no adapter registered for tool '{0}'")]
    UnknownTool(String),
}

impl AdapterError {
    pub fn failed(message: impl Into<String>) -> Self {
        AdapterError::Failed(message.into())
    }
}

/// A pluggable capability invoked by tool steps.
///
/// Inputs and outputs are arbitrary JSON values. An adapter's output is
/// stored under the step's id and becomes visible to later templates.
pub trait Adapter: Send + Sync {
    fn execute(
        &self,
        ctx: &AdapterContext,
        input: Value,
    ) -> impl std::future::Future<Output = Result<Value, AdapterError>> + Send;

    /// Cleanup hook run once at engine shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<(), AdapterError>> + Send {
        async { Ok(()) }
    }
}
