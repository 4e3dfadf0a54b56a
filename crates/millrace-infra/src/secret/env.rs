//! Environment variable secret provider.
//!
//! Key resolution: `MILLRACE_SECRET_{KEY}` first, then `{KEY}` directly.
//! The key is upper-cased and `-`/`.` become `_` for the prefixed lookup, so
//! a flow declaring `slack-token` can be served by `MILLRACE_SECRET_SLACK_TOKEN`.

use millrace_core::repository::secret::SecretProvider;
use millrace_types::error::RepositoryError;

const PREFIX: &str = "MILLRACE_SECRET_";

/// Environment variable secret provider.
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn prefixed_key(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{PREFIX}{normalized}")
}

/// Read one variable. Non-Unicode values are treated as absent since
/// secrets must be valid strings.
fn read_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(val) => Some(val),
        Err(std::env::VarError::NotPresent) => None,
        Err(std::env::VarError::NotUnicode(_)) => None,
    }
}

impl SecretProvider for EnvSecretProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        if let Some(val) = read_var(&prefixed_key(key)) {
            return Ok(Some(val));
        }
        Ok(read_var(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_core::repository::secret::DynSecretProvider;
    use millrace_core::service::secret::SecretResolver;
    use std::sync::Arc;

    #[test]
    fn test_prefixed_key_normalizes() {
        assert_eq!(prefixed_key("slack-token"), "MILLRACE_SECRET_SLACK_TOKEN");
        assert_eq!(prefixed_key("db.password"), "MILLRACE_SECRET_DB_PASSWORD");
    }

    #[tokio::test]
    async fn test_env_provider_reads_plain_key() {
        let key = "MILLRACE_TEST_ENV_PLAIN_7F3A";
        // SAFETY: test-only, unique variable name.
        unsafe { std::env::set_var(key, "plain-value") };

        let provider = EnvSecretProvider::new();
        let val = provider.get(key).await.unwrap();
        assert_eq!(val.as_deref(), Some("plain-value"));

        unsafe { std::env::remove_var(key) };
    }

    #[tokio::test]
    async fn test_env_provider_prefers_prefixed_key() {
        let key = "millrace-test-pref-9c21";
        // SAFETY: test-only, unique variable names.
        unsafe {
            std::env::set_var(key, "plain");
            std::env::set_var("MILLRACE_SECRET_MILLRACE_TEST_PREF_9C21", "prefixed");
        }

        let provider = EnvSecretProvider::new();
        let val = provider.get(key).await.unwrap();
        assert_eq!(val.as_deref(), Some("prefixed"));

        unsafe {
            std::env::remove_var(key);
            std::env::remove_var("MILLRACE_SECRET_MILLRACE_TEST_PREF_9C21");
        }
    }

    #[tokio::test]
    async fn test_env_provider_missing_returns_none() {
        let provider = EnvSecretProvider::default();
        let val = provider.get("MILLRACE_TEST_NEVER_SET_42AB").await.unwrap();
        assert!(val.is_none());
        assert_eq!(SecretProvider::name(&provider), "env");
    }

    #[tokio::test]
    async fn test_resolver_over_env_provider() {
        let key = "MILLRACE_TEST_RESOLVER_5D10";
        // SAFETY: test-only, unique variable name.
        unsafe { std::env::set_var(key, "resolved") };

        let providers: Vec<DynSecretProvider> = vec![Arc::new(EnvSecretProvider::new())];
        let resolver = SecretResolver::new(providers);
        let layer = resolver
            .resolve_all(&[key.to_string(), "MILLRACE_TEST_ABSENT_5D10".to_string()])
            .await;
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[key], serde_json::json!("resolved"));

        unsafe { std::env::remove_var(key) };
    }
}
