//! Runner configuration sourced from the environment

/// Environment-derived runner settings.
///
/// The registry endpoint and shared secret come from the platform's
/// deployment environment; the runner id identifies this instance to the
/// process registry and is generated when not provided.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL of the Kiln web API (`API_BASE_URL`).
    pub api_base_url: String,
    /// Bearer token for registry calls (`RUNNER_SHARED_SECRET`).
    pub shared_secret: Option<String>,
    /// Identity of this runner instance (`RUNNER_ID`).
    pub runner_id: String,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            shared_secret: std::env::var("RUNNER_SHARED_SECRET").ok(),
            runner_id: std::env::var("RUNNER_ID").unwrap_or_else(|_| default_runner_id()),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            shared_secret: None,
            runner_id: default_runner_id(),
        }
    }
}

/// `{hostname}-{suffix}` so multiple runners on one host stay distinct.
fn default_runner_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "runner".to_string());
    format!("{}-{}", host, nanoid::nanoid!(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runner_id_has_suffix() {
        let id = default_runner_id();
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
    }

    #[test]
    fn test_generated_runner_ids_are_distinct() {
        assert_ne!(default_runner_id(), default_runner_id());
    }

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.api_base_url, "http://localhost:3000");
        assert!(config.shared_secret.is_none());
        assert!(!config.runner_id.is_empty());
    }
}
