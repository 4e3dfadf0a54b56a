//! Secret provider trait definition and its object-safe wrapper.
//!
//! Follows the same blanket-impl pattern as `BoxAdapter`:
//! 1. `SecretProvider` uses RPITIT for native async methods
//! 2. `SecretProviderDyn` is object-safe with boxed futures
//! 3. a blanket impl connects the two, and `DynSecretProvider` is the shared handle

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use millrace_types::error::RepositoryError;

/// Trait for read-only secret backends (environment, vault, keychain).
///
/// The engine only ever reads secrets, re-resolving them every time a run is
/// (re)entered so values are never persisted with run state.
pub trait SecretProvider: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Retrieve a secret value by key.
    /// Returns None if the secret does not exist in this provider.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, RepositoryError>> + Send;
}

/// Object-safe version of [`SecretProvider`] with boxed futures.
pub trait SecretProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, RepositoryError>> + Send + 'a>>;
}

impl<T: SecretProvider> SecretProviderDyn for T {
    fn name(&self) -> &str {
        SecretProvider::name(self)
    }

    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, RepositoryError>> + Send + 'a>> {
        Box::pin(self.get(key))
    }
}

/// Shared, type-erased secret provider.
pub type DynSecretProvider = Arc<dyn SecretProviderDyn>;
