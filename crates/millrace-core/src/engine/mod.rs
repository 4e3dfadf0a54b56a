//! Workflow engine: validation, dependency resolution, templating, retries,
//! durable checkpoints, suspension and the run executor.

pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod retry;
pub mod suspension;
pub mod template;

pub use definition::{validate_flow, DefinitionError};
pub use executor::{Delivery, Engine, EngineBuilder, EngineError, StepFailure};
pub use suspension::SuspensionError;
pub use template::{TemplateError, Templater};
