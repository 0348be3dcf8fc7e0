//! Transport discovery
//!
//! ```text
//!   ProbingSharedFs ──ipc mount present──► Ready(SharedFs)
//!        │ no
//!        ▼
//!   ProbingSocket{n} ──device found──► Ready(Socket{device})
//!        │ not yet, n < attempts: sleep, n+1
//!        │ n = attempts
//!        ▼
//!   FilePollingFallback   (degraded: heartbeat only, re-probe later)
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::config::{DaemonConfig, TransportChoice};
use crate::protocol::{IpcLayout, TransportMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    SharedFs,
    Socket { device: PathBuf },
}

impl ProbeOutcome {
    pub fn mode(&self) -> TransportMode {
        match self {
            ProbeOutcome::SharedFs => TransportMode::File,
            ProbeOutcome::Socket { .. } => TransportMode::Socket,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    ProbingSharedFs,
    ProbingSocket { attempt: u32 },
    Ready(ProbeOutcome),
    FilePollingFallback,
}

impl ProbeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeState::Ready(_) | ProbeState::FilePollingFallback)
    }
}

/// What the probe can observe about the guest
pub trait ProbeEnv {
    fn shared_fs_present(&self) -> bool;
    fn find_device(&self) -> Option<PathBuf>;
}

/// Advance the state machine by one step
pub fn step(state: ProbeState, env: &impl ProbeEnv, attempts: u32) -> ProbeState {
    match state {
        ProbeState::ProbingSharedFs => {
            if env.shared_fs_present() {
                ProbeState::Ready(ProbeOutcome::SharedFs)
            } else {
                ProbeState::ProbingSocket { attempt: 0 }
            }
        }
        ProbeState::ProbingSocket { attempt } => match env.find_device() {
            Some(device) => ProbeState::Ready(ProbeOutcome::Socket { device }),
            None if attempt + 1 >= attempts => ProbeState::FilePollingFallback,
            None => ProbeState::ProbingSocket {
                attempt: attempt + 1,
            },
        },
        terminal => terminal,
    }
}

/// The real guest: mounts and device nodes
pub struct SystemProbe<'a> {
    config: &'a DaemonConfig,
}

impl<'a> SystemProbe<'a> {
    pub fn new(config: &'a DaemonConfig) -> Self {
        Self { config }
    }
}

impl ProbeEnv for SystemProbe<'_> {
    fn shared_fs_present(&self) -> bool {
        let layout = IpcLayout::new(&self.config.ipc_dir);
        match self.config.transport {
            TransportChoice::File => true,
            TransportChoice::Socket => false,
            TransportChoice::Auto => layout.is_present() && is_mount_point(&self.config.ipc_dir),
        }
    }

    fn find_device(&self) -> Option<PathBuf> {
        if self.config.transport == TransportChoice::File {
            return None;
        }
        self.config
            .device_paths
            .iter()
            .find(|p| p.exists())
            .cloned()
    }
}

/// A directory on a different device than its parent
///
/// Our own degraded-mode heartbeat creates the ipc skeleton locally, so the
/// skeleton alone does not prove the share is mounted.
#[cfg(unix)]
pub fn is_mount_point(dir: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    let Ok(meta) = std::fs::metadata(dir) else {
        return false;
    };
    let parent = dir.parent().unwrap_or(Path::new("/"));
    match std::fs::metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_mount_point(dir: &Path) -> bool {
    dir.is_dir()
}

/// Run the state machine to a terminal state
///
/// # Arguments
/// * `attempts` - socket probe attempts; 1 for a quick re-probe
pub async fn probe_transport(config: &DaemonConfig, attempts: u32) -> ProbeState {
    let env = SystemProbe::new(config);
    let mut state = ProbeState::ProbingSharedFs;
    while !state.is_terminal() {
        let next = step(state.clone(), &env, attempts);
        if let ProbeState::ProbingSocket { attempt } = next {
            if attempt > 0 {
                debug!(attempt, "serial device not present yet");
                tokio::time::sleep(config.device_retry).await;
            }
        }
        state = next;
    }
    match &state {
        ProbeState::Ready(outcome) => info!(outcome = ?outcome, "transport selected"),
        _ => warn!("no request transport found; running degraded"),
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeEnv {
        shared: bool,
        device_after: Option<u32>,
        calls: Cell<u32>,
    }

    impl ProbeEnv for FakeEnv {
        fn shared_fs_present(&self) -> bool {
            self.shared
        }

        fn find_device(&self) -> Option<PathBuf> {
            let n = self.calls.get();
            self.calls.set(n + 1);
            match self.device_after {
                Some(after) if n >= after => Some(PathBuf::from("/dev/vport0p1")),
                _ => None,
            }
        }
    }

    fn run(env: &FakeEnv, attempts: u32) -> Vec<ProbeState> {
        let mut states = vec![ProbeState::ProbingSharedFs];
        while !states.last().unwrap().is_terminal() {
            let next = step(states.last().unwrap().clone(), env, attempts);
            states.push(next);
        }
        states
    }

    #[test]
    fn test_shared_fs_wins() {
        let env = FakeEnv {
            shared: true,
            device_after: Some(0),
            calls: Cell::new(0),
        };
        let states = run(&env, 5);
        assert_eq!(states.last(), Some(&ProbeState::Ready(ProbeOutcome::SharedFs)));
        assert_eq!(env.calls.get(), 0);
    }

    #[test]
    fn test_socket_found_after_driver_loads() {
        let env = FakeEnv {
            shared: false,
            device_after: Some(3),
            calls: Cell::new(0),
        };
        let states = run(&env, 20);
        assert!(matches!(
            states.last(),
            Some(ProbeState::Ready(ProbeOutcome::Socket { .. }))
        ));
        assert_eq!(env.calls.get(), 4);
    }

    #[test]
    fn test_fallback_after_attempts_exhausted() {
        let env = FakeEnv {
            shared: false,
            device_after: None,
            calls: Cell::new(0),
        };
        let states = run(&env, 3);
        assert_eq!(states.last(), Some(&ProbeState::FilePollingFallback));
        assert_eq!(env.calls.get(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_plain_directory_is_not_a_mount() {
        let dir = tempfile::tempdir().unwrap();
        let child = dir.path().join("ipc");
        std::fs::create_dir(&child).unwrap();
        assert!(!is_mount_point(&child));
        assert!(is_mount_point(Path::new("/")));
    }
}
