//! BoxAdapter -- object-safe dynamic dispatch wrapper for Adapter.
//!
//! 1. Define an object-safe `AdapterDyn` trait with boxed futures
//! 2. Blanket-impl `AdapterDyn` for all `T: Adapter`
//! 3. `BoxAdapter` wraps `Box<dyn AdapterDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::{Adapter, AdapterContext, AdapterError};

/// Object-safe version of [`Adapter`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn AdapterDyn`).
/// A blanket implementation is provided for all types implementing `Adapter`.
pub trait AdapterDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AdapterError>> + Send + 'a>>;

    fn shutdown_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), AdapterError>> + Send + '_>>;
}

impl<T: Adapter> AdapterDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AdapterError>> + Send + 'a>> {
        Box::pin(self.execute(ctx, input))
    }

    fn shutdown_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), AdapterError>> + Send + '_>> {
        Box::pin(self.shutdown())
    }
}

/// Type-erased adapter for runtime tool selection.
///
/// Since `Adapter` uses RPITIT, it cannot be used as a trait object directly.
/// `BoxAdapter` provides equivalent methods that delegate to the inner
/// `AdapterDyn` trait object.
pub struct BoxAdapter {
    inner: Box<dyn AdapterDyn + Send + Sync>,
}

impl BoxAdapter {
    /// Wrap a concrete `Adapter` in a type-erased box.
    pub fn new<T: Adapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub async fn execute(&self, ctx: &AdapterContext, input: Value) -> Result<Value, AdapterError> {
        self.inner.execute_boxed(ctx, input).await
    }

    pub async fn shutdown(&self) -> Result<(), AdapterError> {
        self.inner.shutdown_boxed().await
    }
}

impl std::fmt::Debug for BoxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAdapter").finish_non_exhaustive()
    }
}
