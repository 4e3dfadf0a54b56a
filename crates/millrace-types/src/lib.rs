//! Shared domain types for Millrace.
//!
//! This crate contains the data model the engine operates on: flow
//! definitions, runs and their persisted continuation state, step execution
//! records, suspension tokens, lifecycle events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod run;
