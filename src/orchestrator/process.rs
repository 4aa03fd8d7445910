//! Process handle capability and its OS-backed implementation.
//!
//! The orchestrator only ever talks to [`ProcessLauncher`] and
//! [`ProcessHandle`] (plus [`PortGuard`](super::port::PortGuard) for ports);
//! everything OS-specific (signals, `kill`, `taskkill`) lives behind them.

use super::manifest::ServiceSpec;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    /// Ask the process to exit.
    fn terminate(&mut self) -> io::Result<()>;
    /// Force the process to exit.
    fn kill(&mut self) -> io::Result<()>;
    fn is_alive(&mut self) -> bool;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ServiceSpec) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Spawns real child processes on the tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &ServiceSpec) -> io::Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(spec.name.clone(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(spec.name.clone(), stderr, true));
        }
        Ok(Box::new(ChildProcess { child }))
    }
}

async fn forward_output<R: AsyncRead + Unpin>(name: String, reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => log::warn!("[{}] {}", name, line),
            Ok(Some(line)) => log::info!("[{}] {}", name, line),
            Ok(None) => break,
            Err(e) => {
                log::debug!("[{}] output closed: {}", name, e);
                break;
            }
        }
    }
}

pub struct ChildProcess {
    child: Child,
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        match self.child.id() {
            Some(pid) => signal_terminate(pid),
            None => Ok(()),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Send the graceful stop request without blocking; the helper's exit
/// status is logged from a background task.
#[cfg(unix)]
fn signal_terminate(pid: u32) -> io::Result<()> {
    let helper = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .spawn()?;
    tokio::spawn(report_exit(format!("kill -TERM {}", pid), helper));
    Ok(())
}

#[cfg(windows)]
fn signal_terminate(pid: u32) -> io::Result<()> {
    let helper = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .spawn()?;
    tokio::spawn(report_exit(format!("taskkill /PID {}", pid), helper));
    Ok(())
}

async fn report_exit(what: String, mut helper: Child) {
    match helper.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("{} exited with {}", what, status),
        Err(e) => log::warn!("{} failed: {}", what, e),
    }
}

/// Forcefully kill an arbitrary process (used to free ports).
#[cfg(unix)]
pub async fn force_kill_pid(pid: u32) -> io::Result<()> {
    let status = Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("kill -KILL {} exited with {}", pid, status)))
    }
}

#[cfg(windows)]
pub async fn force_kill_pid(pid: u32) -> io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill /PID {} exited with {}", pid, status)))
    }
}
