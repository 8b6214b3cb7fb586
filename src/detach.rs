//! Process Detacher
//!
//! Launches a session's full research cycle as a background process
//! detached from the caller's lifetime, and reconciles recorded pids
//! against actual OS liveness so crashed runs never appear perpetually
//! running.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::SessionStore;

/// Failure reason recorded when a detached process dies without reaching
/// a terminal status.
pub const REASON_PROCESS_TERMINATED: &str = "process_terminated_unexpectedly";

/// Internal argv marker for the headless-runner invocation.
pub const RUNNER_ARG: &str = "__run";

pub struct Detacher {
    exe: PathBuf,
}

impl Detacher {
    /// Detacher that re-execs the current binary.
    pub fn current() -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
        })
    }

    #[cfg(test)]
    fn with_exe(exe: PathBuf) -> Self {
        Self { exe }
    }

    /// Launch the headless runner for an existing session row. The child
    /// gets its own process group and null stdio, so the caller may exit
    /// without terminating it. Records the pid on the session.
    pub fn spawn(
        &self,
        store: &SessionStore,
        session_id: i64,
        db_path: &Path,
        extra_env: &[(&str, String)],
    ) -> Result<i32> {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&self.exe);
        cmd.arg(RUNNER_ARG)
            .arg(session_id.to_string())
            .env("DEEP_RESEARCH_DB_PATH", db_path);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        let pid = child.id() as i32;
        store.set_pid(session_id, pid)?;
        info!("Detached runner for session {} as pid {}", session_id, pid);
        Ok(pid)
    }

    /// OS-level liveness probe: signal 0 checks existence without
    /// delivering anything. EPERM means the process exists but belongs to
    /// someone else, which still counts as alive.
    pub fn is_alive(pid: i32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Compare non-terminal sessions with a recorded pid against actual
    /// liveness; force-fail any whose process is gone. Returns how many
    /// sessions were corrected.
    pub fn reconcile(store: &SessionStore) -> Result<u32> {
        let mut corrected = 0;
        for session in store.sessions_with_pid()? {
            let pid = match session.pid {
                Some(pid) => pid,
                None => continue,
            };
            if Self::is_alive(pid) {
                continue;
            }
            debug!(
                "Session {} recorded pid {} which is no longer alive",
                session.id, pid
            );
            match store.mark_failed(session.id, REASON_PROCESS_TERMINATED, None) {
                Ok(()) => {
                    warn!(
                        "Session {}: background process {} died, marked failed",
                        session.id, pid
                    );
                    corrected += 1;
                }
                // The runner may have reached a terminal status between
                // our query and the probe; terminal rows stay untouched.
                Err(crate::error::ResearchError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(corrected)
    }
}
