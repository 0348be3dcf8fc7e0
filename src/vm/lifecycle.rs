//! VM lifecycle management
//!
//! Spawning the hypervisor process and watching it through its first
//! moments. Retrying a failed launch is the caller's decision.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a fresh process must survive to count as launched
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("hypervisor exited during startup ({status}); see {}", serial_log.display())]
    ExitedEarly { status: String, serial_log: PathBuf },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provision(#[from] crate::runtime::ProvisionError),

    #[error(transparent)]
    Bridge(#[from] crate::bridge::BridgeError),
}

/// Spawn the hypervisor with piped output
///
/// stdout/stderr are drained into the log under `vm_id`. The child is
/// killed if the returned handle is dropped.
///
/// # Arguments
/// * `binary` - Hypervisor executable
/// * `args` - Output of `build_hypervisor_args`
/// * `vm_id` - Label for log lines
/// * `serial_log` - Pointed to in the error if the process dies immediately
pub async fn spawn_hypervisor(
    binary: &Path,
    args: &[String],
    vm_id: &str,
    serial_log: &Path,
) -> Result<Child, LaunchError> {
    debug!(vm_id, binary = %binary.display(), args = %args.join(" "), "spawning hypervisor");

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            binary: binary.to_path_buf(),
            source,
        })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output(stdout, vm_id.to_string(), false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output(stderr, vm_id.to_string(), true));
    }

    match tokio::time::timeout(STARTUP_GRACE, child.wait()).await {
        Ok(Ok(status)) => Err(LaunchError::ExitedEarly {
            status: status.to_string(),
            serial_log: serial_log.to_path_buf(),
        }),
        Ok(Err(source)) => Err(LaunchError::Io {
            path: binary.to_path_buf(),
            source,
        }),
        Err(_) => Ok(child),
    }
}

async fn drain_output<R: AsyncRead + Unpin>(reader: R, vm_id: String, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(vm_id = %vm_id, "hypervisor: {}", line);
        } else {
            debug!(vm_id = %vm_id, "hypervisor: {}", line);
        }
    }
}
