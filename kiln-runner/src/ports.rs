//! Port probing and allocation for dev-server startup
//!
//! Dev servers bind either loopback or the wildcard address depending on
//! the framework, so a port only counts as free when both binds succeed.

use std::io;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{Instant, sleep};

/// Check whether a TCP port is currently bound on loopback or wildcard.
///
/// Returns `true` as soon as either bind attempt fails with address-in-use.
/// Other bind errors count as "not in use" so an ambiguous OS error never
/// blocks a startup.
pub async fn is_port_in_use(port: u16) -> bool {
    for host in ["127.0.0.1", "0.0.0.0"] {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => drop(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => return true,
            Err(_) => {}
        }
    }
    false
}

/// Scan forward from `start` and return the first free port.
///
/// Lowest free port wins; `None` when the whole range is occupied.
pub async fn find_available_port(start: u16, max_attempts: u16) -> Option<u16> {
    for i in 0..max_attempts {
        let Some(port) = start.checked_add(i) else {
            break;
        };
        if !is_port_in_use(port).await {
            return Some(port);
        }
    }
    None
}

/// Poll until `port` becomes free or the deadline elapses.
///
/// Absorbs the case where a previous server on the same port is still
/// shutting down. Returns whether the port became free.
pub async fn wait_for_release(port: u16, max_wait: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + max_wait;

    loop {
        if !is_port_in_use(port).await {
            return true;
        }
        if Instant::now() >= deadline {
            tracing::warn!(port, "Port was not released before deadline");
            return false;
        }
        sleep(poll_interval).await;
    }
}

/// Kill whatever is listening on `port`, tracked by this runner or not.
///
/// Resolves listener pids with `lsof` and sends SIGKILL to each. Returns
/// the number of processes signalled.
#[cfg(unix)]
pub async fn kill_listeners(port: u16) -> usize {
    let output = match tokio::process::Command::new("lsof")
        .args(["-ti", &format!("tcp:{port}")])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(port, error = %e, "Failed to run lsof for port cleanup");
            return 0;
        }
    };

    let mut killed = 0;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(pid) = line.trim().parse::<i32>() else {
            continue;
        };
        // SAFETY: plain kill(2) call with no shared state.
        if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
            tracing::warn!(port, pid, "Force-killed port listener");
            killed += 1;
        }
    }
    killed
}

#[cfg(not(unix))]
pub async fn kill_listeners(_port: u16) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_bound_port_is_in_use() {
        let (_listener, port) = occupied_port().await;
        assert!(is_port_in_use(port).await);
    }

    #[tokio::test]
    async fn test_released_port_is_free() {
        let (listener, port) = occupied_port().await;
        drop(listener);
        assert!(!is_port_in_use(port).await);
    }

    #[tokio::test]
    async fn test_find_available_port_returns_free_start() {
        let (listener, port) = occupied_port().await;
        drop(listener);
        assert_eq!(find_available_port(port, 10).await, Some(port));
    }

    #[tokio::test]
    async fn test_find_available_port_skips_occupied_start() {
        let (_listener, port) = occupied_port().await;
        let found = find_available_port(port, 10).await;
        assert!(found.is_some());
        assert!(found.unwrap() > port);
    }

    #[tokio::test]
    async fn test_find_available_port_exhausted_range() {
        let (_listener, port) = occupied_port().await;
        assert_eq!(find_available_port(port, 1).await, None);
    }

    #[tokio::test]
    async fn test_wait_for_release_free_port_returns_immediately() {
        let (listener, port) = occupied_port().await;
        drop(listener);
        assert!(wait_for_release(port, Duration::from_millis(100), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_release_times_out_on_held_port() {
        let (_listener, port) = occupied_port().await;
        assert!(
            !wait_for_release(port, Duration::from_millis(150), Duration::from_millis(50)).await
        );
    }

    #[tokio::test]
    async fn test_wait_for_release_observes_mid_wait_release() {
        let (listener, port) = occupied_port().await;

        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            drop(listener);
        });

        assert!(wait_for_release(port, Duration::from_secs(2), Duration::from_millis(25)).await);
    }
}
