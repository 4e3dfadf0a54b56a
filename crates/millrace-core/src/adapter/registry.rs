//! Adapter registry for runtime tool lookup.
//!
//! A simple id-indexed registry of boxed adapters, built by the embedding
//! application and injected at engine construction.

use std::collections::HashMap;
use std::sync::Arc;

use super::box_adapter::BoxAdapter;
use super::Adapter;

/// Registry of available adapters, indexed by tool id.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<BoxAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under the given tool id.
    ///
    /// If an adapter with this id already exists, it is replaced.
    pub fn register<T: Adapter + 'static>(&mut self, tool: impl Into<String>, adapter: T) {
        self.adapters
            .insert(tool.into(), Arc::new(BoxAdapter::new(adapter)));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: Adapter + 'static>(mut self, tool: impl Into<String>, adapter: T) -> Self {
        self.register(tool, adapter);
        self
    }

    /// Look up an adapter by tool id.
    pub fn get(&self, tool: &str) -> Option<Arc<BoxAdapter>> {
        self.adapters.get(tool).cloned()
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.adapters.contains_key(tool)
    }

    /// List all registered tool ids, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Run every adapter's cleanup hook. Failures are logged, not returned.
    pub async fn shutdown_all(&self) {
        for (tool, adapter) in &self.adapters {
            if let Err(e) = adapter.shutdown().await {
                tracing::warn!(tool = tool.as_str(), error = %e, "adapter shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterContext, AdapterError};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Echo;

    impl Adapter for Echo {
        async fn execute(&self, _ctx: &AdapterContext, input: Value) -> Result<Value, AdapterError> {
            Ok(input)
        }
    }

    struct Closing(Arc<AtomicUsize>);

    impl Adapter for Closing {
        async fn execute(&self, _ctx: &AdapterContext, _input: Value) -> Result<Value, AdapterError> {
            Err(AdapterError::failed("closed"))
        }

        async fn shutdown(&self) -> Result<(), AdapterError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            flow: "test".to_string(),
            step_id: "a".to_string(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let registry = AdapterRegistry::new().with("echo", Echo);
        let adapter = registry.get("echo").unwrap();
        let out = adapter.execute(&ctx(), json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert!(registry.get("missing").is_none());
        assert!(registry.contains("echo"));
    }

    #[tokio::test]
    async fn test_adapter_error_text_is_verbatim() {
        let registry = AdapterRegistry::new().with("closing", Closing(Arc::default()));
        let err = registry
            .get("closing")
            .unwrap()
            .execute(&ctx(), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "closed");
    }

    #[tokio::test]
    async fn test_shutdown_all_runs_hooks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = AdapterRegistry::new()
            .with("echo", Echo)
            .with("closing", Closing(counter.clone()));
        registry.shutdown_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_names_sorted() {
        let registry = AdapterRegistry::new().with("zeta", Echo).with("alpha", Echo);
        assert_eq!(registry.list_names(), vec!["alpha", "zeta"]);
    }
}
