//! Graceful shutdown of dev-server processes
//!
//! Escalation order: tunnel close, SIGTERM, bounded wait, SIGKILL, then
//! an optional OS-level sweep of whatever still listens on the port.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;

use kiln_core::ProcessState;

use crate::defaults;
use crate::ports;
use crate::supervisor::{ProcessRecord, ProcessSupervisor};

/// Capability for closing the public tunnel mapped to a dev server's
/// port. The tunnel service itself is external; the shutdown path only
/// consumes this contract.
#[async_trait::async_trait]
pub trait TunnelCloser: Send + Sync {
    async fn close_tunnel(&self, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Options for stopping one project's dev server.
#[derive(Clone, Default)]
pub struct StopOptions {
    /// How long to wait for the process to exit after SIGTERM before
    /// escalating to SIGKILL. `None` uses the default stop timeout.
    pub timeout: Option<Duration>,
    /// Operator-facing reason recorded on the record.
    pub reason: Option<String>,
    /// Tunnel to close before terminating the process.
    pub tunnel_closer: Option<Arc<dyn TunnelCloser>>,
    /// Port override; falls back to the record's port.
    pub port: Option<u16>,
    /// Also kill whatever is listening on the port, tracked or not.
    pub force_kill_port: bool,
}

impl ProcessSupervisor {
    /// Stop a project's dev server.
    ///
    /// Returns `true` once the full stop sequence has run for a tracked
    /// record, whether or not SIGKILL was needed. Returns `false` when no
    /// record exists for the project; in that case `force_kill_port`
    /// (with a port) still performs the OS-level port sweep as a
    /// fallback for orphaned processes.
    pub async fn stop(&self, project_id: &str, options: StopOptions) -> bool {
        let timeout = options.timeout.unwrap_or(defaults::STOP_TIMEOUT);

        let Some(record) = self.get(project_id) else {
            if options.force_kill_port
                && let Some(port) = options.port
            {
                tracing::warn!(project = %project_id, port, "No tracked process, sweeping port listeners");
                ports::kill_listeners(port).await;
                ports::wait_for_release(
                    port,
                    defaults::FORCE_KILL_RELEASE_WAIT,
                    defaults::PORT_RELEASE_POLL_INTERVAL,
                )
                .await;
            }
            return false;
        };

        tracing::info!(
            project = %project_id,
            reason = options.reason.as_deref(),
            "Stopping dev server"
        );
        record.set_state(ProcessState::Stopping);
        record.set_stop_reason(options.reason.clone());

        let port = options.port.or(record.port);
        if let Some(tunnel) = &options.tunnel_closer
            && let Some(port) = port
            && let Err(e) = tunnel.close_tunnel(port).await
        {
            tracing::warn!(project = %project_id, port, error = %e, "Failed to close tunnel");
        }

        if let Some(pid) = record.pid() {
            send_signal(pid, SIGTERM);
        }

        tokio::select! {
            _ = record.wait_for_exit() => {}
            _ = sleep(timeout) => {}
        }

        if !record.has_exited() && !record.was_killed() {
            tracing::warn!(project = %project_id, timeout_ms = timeout.as_millis() as u64, "Process ignored SIGTERM, escalating");
            record.mark_killed();
            if let Some(pid) = record.pid() {
                send_signal(pid, SIGKILL);
            }
            sleep(defaults::REAP_WAIT).await;
        }

        if options.force_kill_port
            && let Some(port) = port
        {
            ports::kill_listeners(port).await;
            ports::wait_for_release(
                port,
                defaults::FORCE_KILL_RELEASE_WAIT,
                defaults::PORT_RELEASE_POLL_INTERVAL,
            )
            .await;
        }

        // The exit handler usually retires the record when the process
        // dies; this covers a process that was already gone.
        self.retire(&record);

        true
    }

    /// Stop every active dev server concurrently.
    ///
    /// Results are collected independently; one project failing to stop
    /// never prevents the others from stopping.
    pub async fn stop_all(&self, tunnel_closer: Option<Arc<dyn TunnelCloser>>) {
        let project_ids: Vec<String> = self
            .list()
            .into_iter()
            .map(|record| record.project_id.clone())
            .collect();
        if project_ids.is_empty() {
            return;
        }

        tracing::info!(count = project_ids.len(), "Stopping all dev servers");

        let mut tasks = JoinSet::new();
        for project_id in project_ids {
            let supervisor = self.clone();
            let tunnel_closer = tunnel_closer.clone();
            tasks.spawn(async move {
                let stopped = supervisor
                    .stop(
                        &project_id,
                        StopOptions {
                            reason: Some("runner shutdown".to_string()),
                            tunnel_closer,
                            ..Default::default()
                        },
                    )
                    .await;
                (project_id, stopped)
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((project_id, true)) => {
                    tracing::debug!(project = %project_id, "Dev server stopped");
                }
                Ok((project_id, false)) => {
                    tracing::warn!(project = %project_id, "Dev server was already gone");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stop task failed");
                }
            }
        }
    }
}

/// SIGTERM the process, wait out the grace period, then SIGKILL.
pub(crate) async fn terminate_with_grace(record: &ProcessRecord, grace: Duration) {
    if record.has_exited() {
        return;
    }

    if let Some(pid) = record.pid() {
        send_signal(pid, SIGTERM);
    }

    tokio::select! {
        _ = record.wait_for_exit() => {}
        _ = sleep(grace) => {}
    }

    if !record.has_exited() {
        record.mark_killed();
        if let Some(pid) = record.pid() {
            send_signal(pid, SIGKILL);
        }
    }
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: i32) -> bool {
    // SAFETY: plain kill(2) call with no shared state.
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn send_signal(_pid: u32, _signal: i32) -> bool {
    false
}

/// Check whether a pid still exists.
///
/// `kill(pid, 0)` probes for existence: EPERM means the process exists
/// but is not signalable by us.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe {
        if libc::kill(pid as i32, 0) == 0 {
            return true;
        }
        matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(code) if code == libc::EPERM
        )
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
