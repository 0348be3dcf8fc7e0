//! Guest daemon settings
//!
//! Filled from the `sandvisor-guest` command line; defaults match what the
//! host wires into the VM.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::{
    DEVICE_NAME, GUEST_IPC_DIR, GUEST_WORK_DIR, HEARTBEAT_INTERVAL, PERMISSION_TIMEOUT,
};

/// Which transport the daemon should use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    /// Run the probe state machine
    Auto,
    /// Treat the ipc directory as the transport without checking for a mount
    File,
    /// Only look for the serial device
    Socket,
}

impl FromStr for TransportChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportChoice::Auto),
            "file" => Ok(TransportChoice::File),
            "socket" => Ok(TransportChoice::Socket),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub ipc_dir: PathBuf,
    pub work_dir: PathBuf,
    pub transport: TransportChoice,
    /// Candidate paths of the virtio-serial port
    pub device_paths: Vec<PathBuf>,
    /// How long to keep looking for the device while the driver loads
    pub device_wait: Duration,
    pub device_retry: Duration,
    pub heartbeat_interval: Duration,
    /// Working-directory scan period (socket mode)
    pub sync_interval: Duration,
    /// Request directory poll period (file mode)
    pub request_poll: Duration,
    /// Response file poll period (file mode)
    pub response_poll: Duration,
    pub permission_timeout: Duration,
    /// Re-probe period while degraded
    pub reprobe_interval: Duration,
    /// Engine command line; the first element is the program
    pub engine_command: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ipc_dir: PathBuf::from(GUEST_IPC_DIR),
            work_dir: PathBuf::from(GUEST_WORK_DIR),
            transport: TransportChoice::Auto,
            device_paths: default_device_paths(),
            device_wait: Duration::from_secs(5),
            device_retry: Duration::from_millis(250),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            sync_interval: Duration::from_secs(2),
            request_poll: Duration::from_millis(500),
            response_poll: Duration::from_millis(200),
            permission_timeout: PERMISSION_TIMEOUT,
            reprobe_interval: Duration::from_secs(10),
            engine_command: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Number of socket probe attempts that fit in `device_wait`
    pub fn device_attempts(&self) -> u32 {
        let retry = self.device_retry.as_millis().max(1);
        ((self.device_wait.as_millis() / retry) as u32).max(1)
    }
}

/// Named port first, then the raw port nodes it may show up as
pub fn default_device_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from(format!("/dev/virtio-ports/{DEVICE_NAME}")),
        PathBuf::from("/dev/vport0p1"),
        PathBuf::from("/dev/vport1p1"),
    ]
}
