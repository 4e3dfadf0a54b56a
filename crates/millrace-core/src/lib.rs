//! Workflow engine and repository trait definitions for Millrace.
//!
//! This crate defines the "ports" (repository and secret provider traits)
//! that the infrastructure layer implements, the adapter contract tools plug
//! into, and the engine itself. It depends only on `millrace-types` -- never
//! on `millrace-infra` or any database/IO crate.

pub mod adapter;
pub mod engine;
pub mod event;
pub mod repository;
pub mod service;
