//! Process supervisor - spawns and tracks dev-server processes
//!
//! Owns the registry of active records (one per project) and the spawn,
//! log-stream wiring, and exit handling for each project's dev server.

use dashmap::DashMap;
use kiln_core::{FailureReason, LogStream, ProcessEvent, ProcessState, ProcessStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc};

use crate::config::RunnerConfig;
use crate::defaults;
use crate::failure::{FailureDiagnosis, classify};
use crate::ports;
use crate::registry::RegistryClient;

/// Launch parameters for one project's dev server.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub project_id: String,
    /// Shell command line, run through `/bin/bash -c`.
    pub command: String,
    pub working_directory: PathBuf,
    /// Port the server is expected to bind, when known up front.
    pub port: Option<u16>,
    /// Environment overlaid onto the runner's own environment.
    pub env: HashMap<String, String>,
}

/// Errors from pre-flight validation, before any process exists.
///
/// Failures after a process has been accepted are reported as data on the
/// record and through `exit`/`error` events, never as errors.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("port {port} is still in use after waiting for release")]
    PortUnavailable { port: u16 },
}

/// Live handle for one project's dev server.
pub struct ProcessRecord {
    pub project_id: String,
    pub command: String,
    pub working_directory: PathBuf,
    pub port: Option<u16>,

    state: RwLock<ProcessState>,
    pid: AtomicU32,
    started_at: Instant,
    /// Wall-clock spawn time reported to the process registry.
    started_at_ms: u64,
    last_health_check_at: RwLock<Option<Instant>>,
    stop_reason: RwLock<Option<String>>,
    failure: RwLock<Option<FailureDiagnosis>>,
    /// Stderr captured during the early diagnostic window.
    early_stderr: Mutex<String>,
    /// Set the instant the OS reports exit, ahead of the state update, so
    /// concurrently running health checks can short-circuit.
    has_exited: AtomicBool,
    killed: AtomicBool,
    exit_notify: Notify,
}

impl ProcessRecord {
    fn new(project_id: String, command: String, working_directory: PathBuf, port: Option<u16>) -> Self {
        Self {
            project_id,
            command,
            working_directory,
            port,
            state: RwLock::new(ProcessState::Idle),
            pid: AtomicU32::new(0),
            started_at: Instant::now(),
            started_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            last_health_check_at: RwLock::new(None),
            stop_reason: RwLock::new(None),
            failure: RwLock::new(None),
            early_stderr: Mutex::new(String::new()),
            has_exited: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            exit_notify: Notify::new(),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.state.write() = state;
    }

    pub fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::Relaxed);
        if pid > 0 { Some(pid) } else { None }
    }

    fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn has_exited(&self) -> bool {
        self.has_exited.load(Ordering::SeqCst)
    }

    fn mark_exited(&self) {
        self.has_exited.store(true, Ordering::SeqCst);
        self.exit_notify.notify_waiters();
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Resolve once the OS has reported process exit.
    pub async fn wait_for_exit(&self) {
        loop {
            let notified = self.exit_notify.notified();
            if self.has_exited() {
                return;
            }
            notified.await;
        }
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.read().clone()
    }

    pub(crate) fn set_stop_reason(&self, reason: Option<String>) {
        *self.stop_reason.write() = reason;
    }

    pub fn failure(&self) -> Option<FailureDiagnosis> {
        self.failure.read().clone()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure.read().as_ref().map(|f| f.reason)
    }

    pub(crate) fn set_failure(&self, diagnosis: FailureDiagnosis) {
        *self.failure.write() = Some(diagnosis);
    }

    pub fn last_health_check_at(&self) -> Option<Instant> {
        *self.last_health_check_at.read()
    }

    pub(crate) fn record_health_check(&self) {
        *self.last_health_check_at.write() = Some(Instant::now());
    }

    /// Stderr captured during the first seconds of the process's life.
    /// The window closes after `STDERR_CAPTURE_WINDOW`; text captured
    /// before then is retained for the life of the record.
    pub fn early_diagnostics(&self) -> String {
        self.early_stderr.lock().clone()
    }

    fn append_early_stderr(&self, line: &str) {
        if self.started_at.elapsed() >= defaults::STDERR_CAPTURE_WINDOW {
            return;
        }
        let mut buf = self.early_stderr.lock();
        if buf.len() >= defaults::STDERR_CAPTURE_LIMIT {
            return;
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            project_id: self.project_id.clone(),
            state: self.state(),
            pid: self.pid(),
            port: self.port,
            uptime_secs: self.uptime().as_secs(),
            failure_reason: self.failure_reason(),
        }
    }
}

/// Supervises all dev-server processes owned by this runner.
///
/// Cheap to clone; all clones share the same registry map and event
/// channel. Concurrent `start` calls for the same project id are not
/// serialized here: the registry insert is last-writer-wins and callers
/// are expected to sequence starts per project.
#[derive(Clone)]
pub struct ProcessSupervisor {
    records: Arc<DashMap<String, Arc<ProcessRecord>>>,
    registry: RegistryClient,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    event_rx: Arc<RwLock<Option<mpsc::UnboundedReceiver<ProcessEvent>>>>,
}

impl ProcessSupervisor {
    pub fn new(config: &RunnerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            records: Arc::new(DashMap::new()),
            registry: RegistryClient::new(config),
            event_tx: tx,
            event_rx: Arc::new(RwLock::new(Some(rx))),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.event_rx.write().take()
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<ProcessRecord>> {
        self.records.get(project_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<ProcessRecord>> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    pub fn statuses(&self) -> Vec<ProcessStatus> {
        self.records.iter().map(|e| e.value().status()).collect()
    }

    /// Start a project's dev server.
    ///
    /// A missing working directory yields a record already in `Failed`
    /// with reason `DirectoryMissing`, without spawning anything or
    /// registering the record. Otherwise the command is spawned through
    /// `/bin/bash -c` in the working directory, the record transitions to
    /// `Starting`, and registration with the process registry is fired
    /// best-effort.
    pub async fn start(&self, options: StartOptions) -> Arc<ProcessRecord> {
        let StartOptions {
            project_id,
            command,
            working_directory,
            port,
            env,
        } = options;

        let record = Arc::new(ProcessRecord::new(project_id, command, working_directory, port));

        if !record.working_directory.is_dir() {
            tracing::warn!(
                project = %record.project_id,
                dir = %record.working_directory.display(),
                "Working directory missing, refusing to spawn"
            );
            record.set_failure(FailureDiagnosis::new(
                FailureReason::DirectoryMissing,
                format!(
                    "working directory does not exist: {}",
                    record.working_directory.display()
                ),
            ));
            record.set_state(ProcessState::Failed);
            return record;
        }

        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(&record.command)
            .current_dir(&record.working_directory)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(project = %record.project_id, error = %e, "Failed to spawn dev server");
                record.set_failure(classify(
                    &e.to_string(),
                    &record.working_directory,
                    Duration::ZERO,
                ));
                record.set_state(ProcessState::Failed);
                self.emit(ProcessEvent::Error {
                    project_id: record.project_id.clone(),
                    message: e.to_string(),
                });
                return record;
            }
        };

        if let Some(pid) = child.id() {
            record.set_pid(pid);
        }
        record.set_state(ProcessState::Starting);
        self.records
            .insert(record.project_id.clone(), record.clone());

        tracing::info!(
            project = %record.project_id,
            pid = record.pid(),
            port = record.port,
            "Spawned dev server"
        );

        if let Some(pid) = record.pid() {
            self.registry.spawn_register(
                &record.project_id,
                pid,
                &record.command,
                record.started_at_ms(),
            );
        }

        let stdout_task = child.stdout.take().map(|out| {
            let this = self.clone();
            let project_id = record.project_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    this.emit(ProcessEvent::Log {
                        project_id: project_id.clone(),
                        stream: LogStream::Stdout,
                        line,
                    });
                }
            })
        });

        let stderr_task = child.stderr.take().map(|err| {
            let this = self.clone();
            let stderr_record = record.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_record.append_early_stderr(&line);
                    this.emit(ProcessEvent::Log {
                        project_id: stderr_record.project_id.clone(),
                        stream: LogStream::Stderr,
                        line,
                    });
                }
            })
        });

        let this = self.clone();
        let monitor_record = record.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            // The pipes close at exit; drain the log tasks so the early
            // diagnostic buffer is complete before classification.
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            this.handle_exit(monitor_record, status).await;
        });

        record
    }

    /// Pre-flight variant of `start`: when the target port is occupied,
    /// wait for it to be released before spawning.
    ///
    /// Fails without spawning when the port is still occupied after
    /// `max_port_wait`.
    pub async fn start_async(
        &self,
        options: StartOptions,
        max_port_wait: Duration,
    ) -> Result<Arc<ProcessRecord>, StartError> {
        if let Some(port) = options.port
            && ports::is_port_in_use(port).await
        {
            tracing::info!(
                project = %options.project_id,
                port,
                "Requested port is busy, waiting for release"
            );
            if !ports::wait_for_release(port, max_port_wait, defaults::PORT_RELEASE_POLL_INTERVAL)
                .await
            {
                return Err(StartError::PortUnavailable { port });
            }
        }

        Ok(self.start(options).await)
    }

    async fn handle_exit(
        &self,
        record: Arc<ProcessRecord>,
        status: std::io::Result<std::process::ExitStatus>,
    ) {
        let uptime = record.uptime();
        let (code, signal) = match &status {
            Ok(s) => (s.code(), exit_signal(s)),
            Err(e) => {
                tracing::error!(project = %record.project_id, error = %e, "Failed to wait on dev server");
                (None, None)
            }
        };

        let prior = record.state();
        let next = if prior == ProcessState::Failed {
            // Already failed (e.g. by a health check); the kill that
            // follows must not overwrite the recorded reason.
            ProcessState::Failed
        } else if code == Some(0) || prior == ProcessState::Stopping {
            ProcessState::Stopped
        } else {
            ProcessState::Failed
        };

        if next == ProcessState::Failed && record.failure_reason().is_none() {
            let raw = match &status {
                Ok(_) => record.early_diagnostics(),
                Err(e) => e.to_string(),
            };
            record.set_failure(classify(&raw, &record.working_directory, uptime));
        }

        record.set_state(next);
        record.mark_exited();

        let failure_reason = record.failure_reason();
        let stderr = match next {
            ProcessState::Failed => {
                let diagnostics = record.early_diagnostics();
                (!diagnostics.is_empty()).then_some(diagnostics)
            }
            _ => None,
        };

        match next {
            ProcessState::Stopped => {
                tracing::info!(project = %record.project_id, code, "Dev server stopped");
            }
            _ => {
                tracing::warn!(
                    project = %record.project_id,
                    code,
                    signal,
                    reason = failure_reason.map(|r| r.to_string()).as_deref(),
                    "Dev server failed"
                );
            }
        }

        self.emit(ProcessEvent::Exit {
            project_id: record.project_id.clone(),
            code,
            signal,
            state: next,
            failure_reason,
            stderr,
        });

        self.retire(&record);
    }

    /// Remove a record from the active registry and deregister it
    /// remotely. Guarded so a record is retired at most once, and a
    /// superseded record can never evict its successor.
    pub(crate) fn retire(&self, record: &Arc<ProcessRecord>) {
        let removed = self
            .records
            .remove_if(&record.project_id, |_, current| Arc::ptr_eq(current, record));
        if removed.is_some() {
            self.registry.spawn_deregister(&record.project_id);
        }
    }

    pub(crate) fn emit(&self, event: ProcessEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn test_supervisor() -> ProcessSupervisor {
        // Unroutable registry endpoint: registration stays best-effort.
        ProcessSupervisor::new(&RunnerConfig {
            api_base_url: "http://127.0.0.1:9".to_string(),
            shared_secret: None,
            runner_id: "test-runner".to_string(),
        })
    }

    fn options(project_id: &str, command: &str, dir: &std::path::Path) -> StartOptions {
        StartOptions {
            project_id: project_id.to_string(),
            command: command.to_string(),
            working_directory: dir.to_path_buf(),
            port: None,
            env: HashMap::new(),
        }
    }

    async fn next_exit(
        rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> (Option<i32>, ProcessState, Option<FailureReason>, Option<String>) {
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for exit event")
                .expect("event channel closed");
            if let ProcessEvent::Exit {
                code,
                state,
                failure_reason,
                stderr,
                ..
            } = event
            {
                return (code, state, failure_reason, stderr);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_directory_fails_without_spawning() {
        let supervisor = test_supervisor();
        let record = supervisor
            .start(options("p1", "npm run dev", std::path::Path::new("/no/such/project")))
            .await;

        assert_eq!(record.state(), ProcessState::Failed);
        assert_eq!(record.failure_reason(), Some(FailureReason::DirectoryMissing));
        assert_eq!(record.pid(), None);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_clean_exit_transitions_to_stopped() {
        let supervisor = test_supervisor();
        let mut rx = supervisor.take_event_receiver().unwrap();
        let dir = tempfile::TempDir::new().unwrap();

        let record = supervisor.start(options("p1", "true", dir.path())).await;
        assert_eq!(record.state(), ProcessState::Starting);

        let (code, state, failure_reason, _) = next_exit(&mut rx).await;
        assert_eq!(code, Some(0));
        assert_eq!(state, ProcessState::Stopped);
        assert_eq!(failure_reason, None);
        assert_eq!(record.state(), ProcessState::Stopped);
        assert!(record.has_exited());
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_crash_is_classified_with_diagnostics() {
        let supervisor = test_supervisor();
        let mut rx = supervisor.take_event_receiver().unwrap();
        let dir = tempfile::TempDir::new().unwrap();

        let record = supervisor
            .start(options("p1", "echo boom >&2; exit 1", dir.path()))
            .await;

        let (code, state, failure_reason, stderr) = next_exit(&mut rx).await;
        assert_eq!(code, Some(1));
        assert_eq!(state, ProcessState::Failed);
        assert_eq!(failure_reason, Some(FailureReason::ImmediateCrash));
        assert_eq!(stderr.as_deref(), Some("boom"));
        assert_eq!(record.failure_reason(), Some(FailureReason::ImmediateCrash));
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stdout_is_streamed_as_log_events() {
        let supervisor = test_supervisor();
        let mut rx = supervisor.take_event_receiver().unwrap();
        let dir = tempfile::TempDir::new().unwrap();

        supervisor.start(options("p1", "echo hello", dir.path())).await;

        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for log event")
            .expect("event channel closed");
        match event {
            ProcessEvent::Log {
                project_id,
                stream,
                line,
            } => {
                assert_eq!(project_id, "p1");
                assert_eq!(stream, LogStream::Stdout);
                assert_eq!(line, "hello");
            }
            other => panic!("expected log event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_crash_classified_as_port_in_use_from_stderr() {
        let supervisor = test_supervisor();
        let mut rx = supervisor.take_event_receiver().unwrap();
        let dir = tempfile::TempDir::new().unwrap();

        supervisor
            .start(options(
                "p1",
                "echo 'Error: listen EADDRINUSE :::3000' >&2; exit 1",
                dir.path(),
            ))
            .await;

        let (_, _, failure_reason, _) = next_exit(&mut rx).await;
        assert_eq!(failure_reason, Some(FailureReason::PortInUse));
    }

    #[tokio::test]
    async fn test_start_async_fails_when_port_stays_occupied() {
        let supervisor = test_supervisor();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::TempDir::new().unwrap();

        let mut opts = options("p1", "sleep 30", dir.path());
        opts.port = Some(port);

        let result = supervisor
            .start_async(opts, Duration::from_millis(300))
            .await;
        match result {
            Err(StartError::PortUnavailable { port: p }) => assert_eq!(p, port),
            Ok(_) => panic!("expected PortUnavailable, got a started record"),
        }
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_start_async_proceeds_once_port_is_released() {
        let supervisor = test_supervisor();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::TempDir::new().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(listener);
        });

        let mut opts = options("p1", "sleep 30", dir.path());
        opts.port = Some(port);

        let record = supervisor
            .start_async(opts, defaults::START_PORT_WAIT)
            .await
            .expect("start_async should succeed after release");
        assert_eq!(record.state(), ProcessState::Starting);
        assert_eq!(supervisor.active_count(), 1);

        supervisor
            .stop(&record.project_id, crate::shutdown::StopOptions::default())
            .await;
    }

    #[tokio::test]
    async fn test_event_receiver_can_only_be_taken_once() {
        let supervisor = test_supervisor();
        assert!(supervisor.take_event_receiver().is_some());
        assert!(supervisor.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let supervisor = test_supervisor();
        let dir = tempfile::TempDir::new().unwrap();

        let record = supervisor.start(options("p1", "sleep 30", dir.path())).await;
        let status = record.status();
        assert_eq!(status.project_id, "p1");
        assert_eq!(status.state, ProcessState::Starting);
        assert!(status.pid.is_some());

        supervisor
            .stop("p1", crate::shutdown::StopOptions::default())
            .await;
    }
}
