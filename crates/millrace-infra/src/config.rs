//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.millrace/` unless
//! `MILLRACE_DATA_DIR` is set) into [`EngineConfig`]. Falls back to defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};

use millrace_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "MILLRACE_DATA_DIR";

/// Data directory: `MILLRACE_DATA_DIR`, else `~/.millrace`, else `./.millrace`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".millrace")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            tracing::debug!(path = %config_path.display(), "loaded engine config");
            config
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_types::flow::TimeoutPolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_valid_toml_overrides_fields() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
default_step_timeout_secs = 30
sweep_interval_ms = 250
suspension_timeout_policy = "timed_out"
max_concurrent_steps = 4
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.default_step_timeout_secs, 30);
        assert_eq!(config.sweep_interval_ms, 250);
        assert_eq!(config.suspension_timeout_policy, TimeoutPolicy::TimedOut);
        assert_eq!(config.max_concurrent_steps, Some(4));
        // Unset fields keep their defaults.
        assert_eq!(config.event_bus_capacity, 1024);
        assert_eq!(config.max_step_output_bytes, 1_048_576);
    }

    #[tokio::test]
    async fn test_malformed_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "sweep_interval_ms = [")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_default_data_dir_ends_with_millrace() {
        if std::env::var_os(DATA_DIR_ENV).is_none() {
            assert!(default_data_dir().ends_with(".millrace"));
        }
    }
}
