//! Local port occupancy checks.

use super::process::force_kill_pid;
use futures::future::BoxFuture;
use std::net::TcpListener;
use std::time::Duration;
use tokio::process::Command;

/// Port inspection and eviction as seen by the orchestrator.
pub trait PortGuard: Send + Sync {
    fn in_use(&self, port: u16) -> bool;
    /// Kill whatever listens on `port`.
    fn evict(&self, port: u16) -> BoxFuture<'_, ()>;
}

/// Checks ports by binding them and evicts occupants with the platform's tools.
#[derive(Debug, Default, Clone)]
pub struct SystemPortGuard;

impl PortGuard for SystemPortGuard {
    fn in_use(&self, port: u16) -> bool {
        port_in_use(port)
    }

    fn evict(&self, port: u16) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for pid in pids_on_port(port).await {
                log::warn!("Port {} is held by pid {}, killing it", port, pid);
                if let Err(e) = force_kill_pid(pid).await {
                    log::warn!("Failed to kill pid {}: {}", pid, e);
                }
            }
        })
    }
}

pub fn port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// PIDs listening on `port`, never including this process.
#[cfg(unix)]
pub async fn pids_on_port(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .args(["-t", "-i", &format!("tcp:{}", port), "-sTCP:LISTEN"])
        .output()
        .await;
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .filter(|pid| *pid != std::process::id())
            .collect(),
        Err(e) => {
            log::warn!("Could not run lsof to inspect port {}: {}", port, e);
            Vec::new()
        }
    }
}

#[cfg(windows)]
pub async fn pids_on_port(port: u16) -> Vec<u32> {
    let output = Command::new("netstat").args(["-ano"]).output().await;
    let suffix = format!(":{}", port);
    match output {
        Ok(output) => {
            let mut pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    // Proto  Local  Foreign  State  PID
                    if cols.len() >= 5 && cols[1].ends_with(&suffix) && cols[3] == "LISTENING" {
                        cols[4].parse().ok()
                    } else {
                        None
                    }
                })
                .filter(|pid| *pid != std::process::id())
                .collect();
            pids.sort_unstable();
            pids.dedup();
            pids
        }
        Err(e) => {
            log::warn!("Could not run netstat to inspect port {}: {}", port, e);
            Vec::new()
        }
    }
}

/// Evict the occupant of `port` and wait up to `wait` for it to be released.
/// Returns whether the port is free afterwards.
pub async fn free_port(guard: &dyn PortGuard, port: u16, wait: Duration, poll: Duration) -> bool {
    if !guard.in_use(port) {
        return true;
    }
    guard.evict(port).await;
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if !guard.in_use(port) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}
