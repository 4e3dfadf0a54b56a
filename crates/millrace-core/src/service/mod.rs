//! Application services composed from repository ports.

pub mod secret;

pub use secret::SecretResolver;
