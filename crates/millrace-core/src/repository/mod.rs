//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (millrace-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation for tests and single-process embedding.

pub mod memory;
pub mod run;
pub mod secret;
