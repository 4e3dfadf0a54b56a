//! Secret provider implementations.
//!
//! - `env`: environment variable provider (read-only)

pub mod env;

pub use env::EnvSecretProvider;
