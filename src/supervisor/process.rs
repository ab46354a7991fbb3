//! One supervised operating-system child process.
//!
//! A `ProcessHandle` is created either by spawning (normal path) or by
//! reclaiming a PID file left behind by a previous manager run (crash
//! recovery). PID files are advisory: liveness is always re-validated against
//! the OS, and on Linux the command line is matched against the expected
//! executable to reject PID reuse by an unrelated process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};

/// Poll step while waiting for a signalled process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Settle time after SIGKILL before declaring the stop failed.
const KILL_SETTLE: Duration = Duration::from_millis(500);

/// PID file location for a component. Pure function of the component id.
pub fn pid_file_path(pid_dir: &Path, component_id: &str) -> PathBuf {
    pid_dir.join(format!("{component_id}.pid"))
}

/// Everything needed to launch one component process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub component_id: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Optional isolated interpreter the executable is launched through
    pub runtime: Option<PathBuf>,
    pub pid_dir: PathBuf,
    pub logs_dir: PathBuf,
}

#[derive(Debug)]
pub struct ProcessHandle {
    component_id: String,
    pid: u32,
    pid_file: PathBuf,
    /// Token expected somewhere in the process command line
    expected_exe: String,
    /// Present when this handle spawned the child itself; used to reap it
    child: Option<tokio::process::Child>,
}

impl ProcessHandle {
    /// Launch a detached child, persist its PID file, and return a live
    /// handle. Stdout/stderr are appended to per-component log files.
    pub async fn spawn(spec: &SpawnSpec) -> Result<Self> {
        fs::create_dir_all(&spec.pid_dir)?;
        fs::create_dir_all(&spec.logs_dir)?;

        let log_file = spec.logs_dir.join(format!("{}.log", spec.component_id));
        let err_file = spec.logs_dir.join(format!("{}.err", spec.component_id));
        let stdout = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        let stderr = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&err_file)?;

        let mut cmd = match &spec.runtime {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&spec.executable);
                cmd
            }
            None => Command::new(&spec.executable),
        };
        cmd.args(&spec.args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| WardenError::SpawnFailed {
            component: spec.component_id.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| WardenError::SpawnFailed {
            component: spec.component_id.clone(),
            reason: "child exited before a pid could be read".to_string(),
        })?;

        let pid_file = pid_file_path(&spec.pid_dir, &spec.component_id);
        fs::write(&pid_file, pid.to_string())?;
        info!(
            component = %spec.component_id,
            pid = pid,
            "Spawned component, PID file written"
        );

        Ok(Self {
            component_id: spec.component_id.clone(),
            pid,
            pid_file,
            expected_exe: exe_token(&spec.executable),
            child: Some(child),
        })
    }

    /// Rebuild a handle from a PID file written by a previous manager run.
    ///
    /// Returns None (and removes the file) when the file is absent,
    /// unreadable, or points at a dead or mismatched process.
    pub fn reclaim(pid_dir: &Path, component_id: &str, expected_exe: &Path) -> Option<Self> {
        let pid_file = pid_file_path(pid_dir, component_id);
        if !pid_file.exists() {
            return None;
        }

        let pid = match fs::read_to_string(&pid_file) {
            Ok(raw) => match raw.trim().parse::<u32>() {
                Ok(pid) => pid,
                Err(_) => {
                    warn!(component = %component_id, "Corrupt PID file, removing");
                    let _ = fs::remove_file(&pid_file);
                    return None;
                }
            },
            Err(e) => {
                warn!(component = %component_id, error = %e, "Unreadable PID file, removing");
                let _ = fs::remove_file(&pid_file);
                return None;
            }
        };

        let token = exe_token(expected_exe);
        if !process_alive(pid) || !cmdline_matches(pid, &token) {
            debug!(
                component = %component_id,
                pid = pid,
                "Stale PID file (process dead or mismatched), removing"
            );
            let _ = fs::remove_file(&pid_file);
            return None;
        }

        info!(component = %component_id, pid = pid, "Reclaimed live process from PID file");
        Some(Self {
            component_id: component_id.to_string(),
            pid,
            pid_file,
            expected_exe: token,
            child: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Non-blocking liveness check. Reaps the child when we spawned it.
    pub fn is_alive(&mut self) -> bool {
        if let Some(child) = &mut self.child {
            match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) => {
                    self.child = None;
                    false
                }
                Err(_) => false,
            }
        } else {
            process_alive(self.pid) && cmdline_matches(self.pid, &self.expected_exe)
        }
    }

    /// Graceful stop with mandatory escalation: SIGTERM, bounded grace wait,
    /// then SIGKILL. Returns whether the kill escalation fired.
    pub async fn terminate(&mut self, grace: Duration) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }

        debug!(component = %self.component_id, pid = self.pid, "Sending SIGTERM");
        send_signal(self.pid, TermSignal::Term);

        if self.wait_for_exit(grace).await {
            return Ok(false);
        }

        warn!(
            component = %self.component_id,
            pid = self.pid,
            "Did not stop within grace period, sending SIGKILL"
        );
        send_signal(self.pid, TermSignal::Kill);

        if self.wait_for_exit(KILL_SETTLE).await {
            return Ok(true);
        }

        Err(WardenError::StopFailed {
            component: self.component_id.clone(),
            pid: self.pid,
        })
    }

    async fn wait_for_exit(&mut self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Remove the PID file. Called by the owning manager once a stop is
    /// confirmed.
    pub fn remove_pid_file(&self) {
        if self.pid_file.exists() {
            if let Err(e) = fs::remove_file(&self.pid_file) {
                warn!(component = %self.component_id, error = %e, "Could not remove PID file");
            }
        }
    }
}

enum TermSignal {
    Term,
    Kill,
}

/// Children are spawned as process-group leaders, so the signal goes to the
/// whole group and a component cannot strand grandchildren behind a dead
/// wrapper.
#[cfg(unix)]
fn send_signal(pid: u32, signal: TermSignal) {
    let sig = match signal {
        TermSignal::Term => libc::SIGTERM,
        TermSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        if libc::kill(-(pid as i32), sig) != 0 {
            // no such group; fall back to the single process
            libc::kill(pid as i32, sig);
        }
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: TermSignal) {}

/// Check process existence without sending a signal.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Best-effort command-line verification against PID reuse. Only Linux
/// exposes the command line cheaply; elsewhere existence has to be enough.
#[cfg(target_os = "linux")]
fn cmdline_matches(pid: u32, expected: &str) -> bool {
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            let cmdline = String::from_utf8_lossy(&raw);
            cmdline.split('\0').any(|part| {
                Path::new(part)
                    .file_name()
                    .map(|name| name.to_string_lossy() == expected)
                    .unwrap_or(false)
            })
        }
        // /proc entry gone means the process is too
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn cmdline_matches(_pid: u32, _expected: &str) -> bool {
    true
}

fn exe_token(executable: &Path) -> String {
    executable
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string_lossy().into_owned())
}
