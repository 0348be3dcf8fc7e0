//! VM Handle - represents one session VM and its resources
//!
//! Each VmHandle tracks one hypervisor process throughout its lifecycle:
//! Starting -> Running -> Stopping (or Failed)

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{info, warn};

use crate::runtime::assets::SESSION_VARS_FILE;
use crate::runtime::TransportKind;

/// How long a graceful stop may take before the process is killed
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Status of a session VM
#[derive(Debug, Clone, PartialEq)]
pub enum VmStatus {
    /// Process spawned, guest not yet heard from
    Starting,
    /// Guest is up
    Running,
    /// Shutdown requested
    Stopping,
    /// Process exited unexpectedly or could not be started
    Failed(String),
}

/// Represents a single session VM with all its resources
pub struct VmHandle {
    /// Unique identifier for this VM (e.g., "vm-01926abc...")
    pub vm_id: String,
    pub session_id: String,
    pub session_dir: PathBuf,
    pub transport: TransportKind,
    process: Child,
    pub status: VmStatus,
    pub created_at: Instant,
}

impl VmHandle {
    pub fn new(
        vm_id: String,
        session_id: String,
        session_dir: PathBuf,
        transport: TransportKind,
        process: Child,
    ) -> Self {
        Self {
            vm_id,
            session_id,
            session_dir,
            transport,
            process,
            status: VmStatus::Starting,
            created_at: Instant::now(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = VmStatus::Running;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = VmStatus::Failed(error);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, VmStatus::Running)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn serial_log(&self) -> PathBuf {
        self.session_dir.join("serial.log")
    }

    /// Non-blocking check whether the process is still alive
    pub fn try_status(&mut self) -> &VmStatus {
        if matches!(self.status, VmStatus::Failed(_)) {
            return &self.status;
        }
        match self.process.try_wait() {
            Ok(Some(exit)) if self.status != VmStatus::Stopping => {
                self.status = VmStatus::Failed(format!("hypervisor exited with {exit}"));
            }
            Ok(_) => {}
            Err(e) => self.status = VmStatus::Failed(e.to_string()),
        }
        &self.status
    }

    /// Stop the VM: SIGTERM, bounded wait, then kill
    pub async fn shutdown(&mut self) {
        self.status = VmStatus::Stopping;
        info!(vm_id = %self.vm_id, "stopping VM");

        self.signal_terminate();

        match tokio::time::timeout(STOP_GRACE, self.process.wait()).await {
            Ok(Ok(status)) => info!(vm_id = %self.vm_id, %status, "hypervisor exited"),
            _ => {
                // Process might already be dead
                if let Err(e) = self.process.kill().await {
                    warn!(vm_id = %self.vm_id, error = %e, "failed to kill hypervisor");
                }
            }
        }

        self.cleanup_files();
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = self.process.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(vm_id = %self.vm_id, error = %e, "failed to signal hypervisor");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {}

    /// Remove per-session files that are useless once the VM is gone
    pub fn cleanup_files(&self) {
        let vars = self.session_dir.join(SESSION_VARS_FILE);
        if vars.exists() {
            if let Err(e) = std::fs::remove_file(&vars) {
                warn!(vm_id = %self.vm_id, path = %vars.display(), error = %e, "failed to remove firmware vars");
            }
        }
    }
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle")
            .field("vm_id", &self.vm_id)
            .field("session_id", &self.session_id)
            .field("session_dir", &self.session_dir)
            .field("transport", &self.transport)
            .field("status", &self.status)
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sleeper(secs: u32) -> Child {
        tokio::process::Command::new("/bin/sh")
            .args(["-c", &format!("sleep {secs}")])
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = VmHandle::new(
            "vm-1".into(),
            "s1".into(),
            dir.path().to_path_buf(),
            TransportKind::Socket,
            sleeper(30),
        );
        handle.mark_running();
        assert_eq!(handle.try_status(), &VmStatus::Running);
        handle.shutdown().await;
        assert_eq!(handle.try_status(), &VmStatus::Stopping);
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let mut handle = VmHandle::new(
            "vm-2".into(),
            "s2".into(),
            dir.path().to_path_buf(),
            TransportKind::SharedFs,
            child,
        );
        for _ in 0..40 {
            if matches!(handle.try_status(), VmStatus::Failed(_)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(matches!(handle.try_status(), VmStatus::Failed(_)));
    }
}
