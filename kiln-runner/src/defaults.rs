use std::time::Duration;

/// Stderr written inside this window after spawn is kept for diagnostics.
pub const STDERR_CAPTURE_WINDOW: Duration = Duration::from_secs(5);
/// Upper bound on retained diagnostic stderr.
pub const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

/// Exits earlier than this after spawn classify as an immediate crash.
pub const IMMEDIATE_CRASH_WINDOW: Duration = Duration::from_secs(3);

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const HEALTH_CHECK_ATTEMPTS: u32 = 10;

pub const PORT_SCAN_ATTEMPTS: u16 = 100;
pub const PORT_RELEASE_MAX_WAIT: Duration = Duration::from_millis(10_000);
pub const PORT_RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long `start_async` waits for a pre-assigned port to free up.
pub const START_PORT_WAIT: Duration = Duration::from_millis(5_000);

pub const STOP_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Grace period between SIGTERM and SIGKILL on the health-check kill path.
pub const KILL_GRACE: Duration = Duration::from_secs(2);
/// Wait for the OS to reap a process after SIGKILL.
pub const REAP_WAIT: Duration = Duration::from_secs(1);
/// Wait for the port after force-killing its listeners.
pub const FORCE_KILL_RELEASE_WAIT: Duration = Duration::from_secs(2);
