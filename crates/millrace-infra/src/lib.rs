//! Infrastructure layer for Millrace.
//!
//! Implements the ports defined in `millrace-core`: SQLite run storage,
//! the environment secret provider, and the `config.toml` loader.

pub mod config;
pub mod secret;
pub mod sqlite;
