//! Process registry client
//!
//! Tells the Kiln web API which OS process currently backs a project.
//! All calls are fire-and-forget: local process state is authoritative
//! and remote bookkeeping is advisory, so failures are logged and never
//! retried or allowed to block a state transition.

use kiln_core::RegisterProcessRequest;
use std::time::Duration;

use crate::config::RunnerConfig;

#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
    shared_secret: Option<String>,
    runner_id: String,
}

impl RegistryClient {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            shared_secret: config.shared_secret.clone(),
            runner_id: config.runner_id.clone(),
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Register a freshly spawned process. Fire-and-forget.
    pub fn spawn_register(&self, project_id: &str, pid: u32, command: &str, started_at: u64) {
        let this = self.clone();
        let body = RegisterProcessRequest {
            project_id: project_id.to_string(),
            pid,
            command: command.to_string(),
            runner_id: this.runner_id.clone(),
            started_at,
        };

        tokio::spawn(async move {
            let url = format!("{}/api/runner/process/register", this.base_url);
            let mut request = this.client.post(&url).json(&body);
            if let Some(token) = &this.shared_secret {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(project = %body.project_id, pid = body.pid, "Registered process");
                }
                Ok(resp) => {
                    tracing::warn!(
                        project = %body.project_id,
                        status = %resp.status(),
                        "Process registration rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(project = %body.project_id, error = %e, "Process registration failed");
                }
            }
        });
    }

    /// Remove a project's process registration. Fire-and-forget.
    pub fn spawn_deregister(&self, project_id: &str) {
        let this = self.clone();
        let project_id = project_id.to_string();

        tokio::spawn(async move {
            let url = format!("{}/api/runner/process/{}", this.base_url, project_id);
            let mut request = this.client.delete(&url);
            if let Some(token) = &this.shared_secret {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(project = %project_id, "Deregistered process");
                }
                Ok(resp) => {
                    tracing::warn!(
                        project = %project_id,
                        status = %resp.status(),
                        "Process deregistration rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(project = %project_id, error = %e, "Process deregistration failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = RegistryClient::new(&RunnerConfig {
            api_base_url: "http://localhost:3000/".to_string(),
            shared_secret: None,
            runner_id: "runner-a".to_string(),
        });
        assert_eq!(client.base_url, "http://localhost:3000");
        assert_eq!(client.runner_id(), "runner-a");
    }

    #[tokio::test]
    async fn test_register_against_unreachable_api_does_not_panic() {
        let client = RegistryClient::new(&RunnerConfig {
            api_base_url: "http://127.0.0.1:9".to_string(),
            shared_secret: Some("secret".to_string()),
            runner_id: "runner-a".to_string(),
        });

        client.spawn_register("proj-1", 1234, "npm run dev", 0);
        client.spawn_deregister("proj-1");

        // Give the fire-and-forget tasks a moment to run and log.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
