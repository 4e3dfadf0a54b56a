//! Secret resolution service.
//!
//! `SecretResolver` resolves the secret names a flow declares through a chain
//! of providers in priority order. It lives in `millrace-core` and depends
//! only on the `DynSecretProvider` abstraction -- never on concrete infra
//! implementations.

use serde_json::{Map, Value};

use crate::repository::secret::DynSecretProvider;
use millrace_types::error::RepositoryError;

/// Resolves secrets across multiple backends.
///
/// Providers are ordered by precedence (first match wins).
#[derive(Clone, Default)]
pub struct SecretResolver {
    providers: Vec<DynSecretProvider>,
}

impl SecretResolver {
    /// Create a resolver with the given provider chain, highest priority first.
    pub fn new(providers: Vec<DynSecretProvider>) -> Self {
        Self { providers }
    }

    /// Resolve a single secret by iterating providers in priority order.
    pub async fn get_secret(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        for provider in &self.providers {
            if let Some(value) = provider.get_boxed(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Resolve every named secret into a template layer.
    ///
    /// Missing secrets are left out (they render empty). A provider error is
    /// logged and treated as missing for that key so one unavailable backend
    /// cannot block a run.
    pub async fn resolve_all(&self, keys: &[String]) -> Map<String, Value> {
        let mut resolved = Map::new();
        for key in keys {
            match self.get_secret(key).await {
                Ok(Some(value)) => {
                    resolved.insert(key.clone(), Value::String(value));
                }
                Ok(None) => {
                    tracing::warn!(secret = key.as_str(), "secret not found in any provider");
                }
                Err(e) => {
                    tracing::warn!(secret = key.as_str(), error = %e, "secret lookup failed");
                }
            }
        }
        resolved
    }

    /// Mask a secret value, showing only the last 4 characters.
    ///
    /// - "sk-abcdefghijklmnop" -> "****mnop"
    /// - "abc" -> "****" (too short to show any chars)
    pub fn mask_secret(value: &str) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= 4 {
            "****".to_string()
        } else {
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("****{tail}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::secret::SecretProvider;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct MockProvider {
        name: &'static str,
        values: HashMap<String, String>,
        fail: bool,
    }

    impl MockProvider {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                values: HashMap::new(),
                fail: false,
            }
        }

        fn with_value(mut self, key: &str, value: &str) -> Self {
            self.values.insert(key.to_string(), value.to_string());
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    impl SecretProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
            if self.fail {
                return Err(RepositoryError::Connection);
            }
            Ok(self.values.get(key).cloned())
        }
    }

    #[tokio::test]
    async fn test_first_provider_wins() {
        let resolver = SecretResolver::new(vec![
            Arc::new(MockProvider::new("env").with_value("TOKEN", "from-env")),
            Arc::new(MockProvider::new("vault").with_value("TOKEN", "from-vault")),
        ]);
        assert_eq!(
            resolver.get_secret("TOKEN").await.unwrap(),
            Some("from-env".to_string())
        );
    }

    #[tokio::test]
    async fn test_falls_through_to_later_provider() {
        let resolver = SecretResolver::new(vec![
            Arc::new(MockProvider::new("env")),
            Arc::new(MockProvider::new("vault").with_value("TOKEN", "from-vault")),
        ]);
        assert_eq!(
            resolver.get_secret("TOKEN").await.unwrap(),
            Some("from-vault".to_string())
        );
        assert_eq!(resolver.get_secret("MISSING").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_all_skips_missing_and_failures() {
        let resolver = SecretResolver::new(vec![
            Arc::new(MockProvider::new("env").with_value("A", "1")),
        ]);
        let resolved = resolver
            .resolve_all(&["A".to_string(), "B".to_string()])
            .await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["A"], Value::String("1".to_string()));

        let broken = SecretResolver::new(vec![Arc::new(MockProvider::new("down").failing())]);
        assert!(broken.resolve_all(&["A".to_string()]).await.is_empty());
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(SecretResolver::mask_secret("sk-abcdefghijklmnop"), "****mnop");
        assert_eq!(SecretResolver::mask_secret("abcd"), "****");
        assert_eq!(SecretResolver::mask_secret(""), "****");
        assert_eq!(SecretResolver::mask_secret("abcde"), "****bcde");
    }
}
