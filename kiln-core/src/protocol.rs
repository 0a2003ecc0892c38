//! Runner protocol types
//!
//! These types are shared between the runner and the Kiln web API:
//! the process lifecycle state machine, the failure taxonomy attached to
//! failed records, the event payloads emitted while a dev server runs,
//! and the bodies of the process-registry HTTP calls.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised dev-server process.
///
/// Normal flow is `Idle -> Starting -> Running -> Stopping -> Stopped`.
/// `Failed` is reachable from `Starting` or `Running` on any abnormal
/// exit or spawn error. `Stopped` and `Failed` are terminal; a new start
/// always creates a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a dev-server process failed.
///
/// Closed taxonomy, attached to the record as data rather than thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PortInUse,
    CommandNotFound,
    DirectoryMissing,
    PermissionDenied,
    ImmediateCrash,
    HealthCheckTimeout,
    HealthCheckFailed,
    Unknown,
}

impl FailureReason {
    /// Operator-facing hint surfaced in logs and the UI. Diagnostic only;
    /// never consulted by control flow.
    pub fn suggestion(&self) -> &'static str {
        match self {
            FailureReason::PortInUse => {
                "Another process is using this port. Stop it or pick a different port."
            }
            FailureReason::CommandNotFound => {
                "Check that dependencies are installed and the command exists."
            }
            FailureReason::DirectoryMissing => {
                "The project directory no longer exists. Regenerate or re-clone the project."
            }
            FailureReason::PermissionDenied => {
                "The runner lacks permission to execute this command. Check file permissions."
            }
            FailureReason::ImmediateCrash => {
                "The server crashed right after starting. Check that dependencies are installed."
            }
            FailureReason::HealthCheckTimeout => {
                "The server never started listening on its port. Check the startup logs."
            }
            FailureReason::HealthCheckFailed => {
                "The server did not come up on the expected port. Check the startup logs."
            }
            FailureReason::Unknown => "Check the server logs for details.",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::PortInUse => write!(f, "port_in_use"),
            FailureReason::CommandNotFound => write!(f, "command_not_found"),
            FailureReason::DirectoryMissing => write!(f, "directory_missing"),
            FailureReason::PermissionDenied => write!(f, "permission_denied"),
            FailureReason::ImmediateCrash => write!(f, "immediate_crash"),
            FailureReason::HealthCheckTimeout => write!(f, "health_check_timeout"),
            FailureReason::HealthCheckFailed => write!(f, "health_check_failed"),
            FailureReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Events emitted by the supervisor while a dev server runs.
///
/// The consumer is the platform's event relay; the runner itself only
/// produces these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// A line of output from the child process.
    Log {
        project_id: String,
        stream: LogStream,
        line: String,
    },

    /// The process exited, normally or otherwise.
    Exit {
        project_id: String,
        code: Option<i32>,
        signal: Option<i32>,
        state: ProcessState,
        failure_reason: Option<FailureReason>,
        /// Stderr captured during the early diagnostic window, present
        /// only when the exit was classified as a failure.
        stderr: Option<String>,
    },

    /// The process could not be created at all.
    Error { project_id: String, message: String },
}

impl ProcessEvent {
    pub fn project_id(&self) -> &str {
        match self {
            ProcessEvent::Log { project_id, .. } => project_id,
            ProcessEvent::Exit { project_id, .. } => project_id,
            ProcessEvent::Error { project_id, .. } => project_id,
        }
    }
}

/// Body of `POST /api/runner/process/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProcessRequest {
    pub project_id: String,
    pub pid: u32,
    pub command: String,
    pub runner_id: String,
    /// Unix epoch milliseconds at spawn time.
    pub started_at: u64,
}

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub project_id: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub uptime_secs: u64,
    pub failure_reason: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Starting.to_string(), "starting");
        assert_eq!(ProcessState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProcessState::Stopped.is_terminal());
        assert!(ProcessState::Failed.is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert!(!ProcessState::Stopping.is_terminal());
    }

    #[test]
    fn test_failure_reason_wire_format() {
        let json = serde_json::to_string(&FailureReason::HealthCheckFailed).unwrap();
        assert_eq!(json, r#""health_check_failed""#);

        let parsed: FailureReason = serde_json::from_str(r#""immediate_crash""#).unwrap();
        assert_eq!(parsed, FailureReason::ImmediateCrash);
    }

    #[test]
    fn test_every_failure_reason_has_a_suggestion() {
        let reasons = [
            FailureReason::PortInUse,
            FailureReason::CommandNotFound,
            FailureReason::DirectoryMissing,
            FailureReason::PermissionDenied,
            FailureReason::ImmediateCrash,
            FailureReason::HealthCheckTimeout,
            FailureReason::HealthCheckFailed,
            FailureReason::Unknown,
        ];
        for reason in reasons {
            assert!(!reason.suggestion().is_empty());
        }
    }

    #[test]
    fn test_exit_event_serialization() {
        let event = ProcessEvent::Exit {
            project_id: "proj-1".to_string(),
            code: Some(1),
            signal: None,
            state: ProcessState::Failed,
            failure_reason: Some(FailureReason::ImmediateCrash),
            stderr: Some("boom".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"exit""#));
        assert!(json.contains(r#""failure_reason":"immediate_crash""#));
        assert_eq!(event.project_id(), "proj-1");
    }

    #[test]
    fn test_register_request_uses_camel_case() {
        let req = RegisterProcessRequest {
            project_id: "proj-1".to_string(),
            pid: 4321,
            command: "npm run dev".to_string(),
            runner_id: "runner-a".to_string(),
            started_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""projectId":"proj-1""#));
        assert!(json.contains(r#""runnerId":"runner-a""#));
        assert!(json.contains(r#""startedAt":1700000000000"#));
    }
}
