//! Health verification for freshly started dev servers
//!
//! A bound listener on the expected port counts as healthy. Many
//! frameworks bind the socket before their first build finishes, so an
//! HTTP-level probe would report false negatives during startup.

use kiln_core::{FailureReason, ProcessState};
use tokio::time::sleep;

use crate::defaults;
use crate::failure::FailureDiagnosis;
use crate::ports;
use crate::remediate::fix_port_in_project_config;
use crate::shutdown::terminate_with_grace;
use crate::supervisor::{ProcessRecord, ProcessSupervisor};

/// Result of a health check run against a project's dev server.
#[derive(Debug)]
pub struct HealthCheckOutcome {
    pub healthy: bool,
    pub error: Option<String>,
    /// Whether the project manifest was rewritten to the expected port.
    pub port_fixed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    #[error("dev server exited before becoming healthy{}", diagnostics_suffix(.diagnostics))]
    Exited { diagnostics: Option<String> },

    #[error("health check timed out after {attempts} attempts{}", diagnostics_suffix(.diagnostics))]
    Timeout {
        attempts: u32,
        diagnostics: Option<String>,
    },
}

fn diagnostics_suffix(diagnostics: &Option<String>) -> String {
    match diagnostics {
        Some(text) => format!(": {text}"),
        None => String::new(),
    }
}

fn captured_diagnostics(record: Option<&ProcessRecord>) -> Option<String> {
    record
        .map(|r| r.early_diagnostics())
        .filter(|d| !d.is_empty())
}

/// Poll once per second until the port is bound or `max_attempts` is
/// exhausted.
///
/// When a record is supplied and its process exits mid-poll, fails
/// immediately with the captured diagnostic output, even if the port
/// later becomes bound by something else.
pub async fn verify(
    port: u16,
    record: Option<&ProcessRecord>,
    max_attempts: u32,
) -> Result<(), HealthCheckError> {
    for attempt in 0..max_attempts {
        if let Some(record) = record
            && record.has_exited()
        {
            return Err(HealthCheckError::Exited {
                diagnostics: captured_diagnostics(Some(record)),
            });
        }

        if ports::is_port_in_use(port).await {
            return Ok(());
        }

        tracing::debug!(port, attempt, "Port not bound yet");
        if attempt + 1 < max_attempts {
            sleep(defaults::HEALTH_CHECK_INTERVAL).await;
        }
    }

    Err(HealthCheckError::Timeout {
        attempts: max_attempts,
        diagnostics: captured_diagnostics(record),
    })
}

impl ProcessSupervisor {
    /// Confirm a freshly started dev server is serving and update the
    /// record accordingly.
    ///
    /// On success the record transitions to `Running`. On failure the
    /// project manifest is patched toward the expected port (best
    /// effort), the record transitions to `Failed` with reason
    /// `HealthCheckFailed`, and the still-running process is killed with
    /// a SIGTERM-then-SIGKILL escalation.
    pub async fn run_health_check(&self, project_id: &str, port: u16) -> HealthCheckOutcome {
        self.run_health_check_with(project_id, port, defaults::HEALTH_CHECK_ATTEMPTS)
            .await
    }

    pub async fn run_health_check_with(
        &self,
        project_id: &str,
        port: u16,
        max_attempts: u32,
    ) -> HealthCheckOutcome {
        let Some(record) = self.get(project_id) else {
            return HealthCheckOutcome {
                healthy: false,
                error: Some(format!("no active process for project {project_id}")),
                port_fixed: false,
            };
        };

        match verify(port, Some(&record), max_attempts).await {
            Ok(()) => {
                record.set_state(ProcessState::Running);
                record.record_health_check();
                tracing::info!(project = %project_id, port, "Dev server is healthy");
                HealthCheckOutcome {
                    healthy: true,
                    error: None,
                    port_fixed: false,
                }
            }
            Err(e) => {
                tracing::warn!(project = %project_id, port, error = %e, "Health check failed");

                let port_fixed = fix_port_in_project_config(&record.working_directory, port);

                record.set_failure(FailureDiagnosis::new(
                    FailureReason::HealthCheckFailed,
                    e.to_string(),
                ));
                record.set_state(ProcessState::Failed);
                terminate_with_grace(&record, defaults::KILL_GRACE).await;

                HealthCheckOutcome {
                    healthy: false,
                    error: Some(e.to_string()),
                    port_fixed,
                }
            }
        }
    }
}
