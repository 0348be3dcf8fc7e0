//! Session VM - one hypervisor plus its control channel
//!
//! `SessionVm::start` is the whole launch sequence:
//!
//! ```text
//!   Provisioner::ensure_ready()
//!        │
//!        ▼
//!   <base>/sessions/<id>/{ipc/, serial.log}
//!        │
//!        ▼
//!   bridge::connect()   (socket mode binds the TCP listener here)
//!        │
//!        ▼
//!   firmware vars copy → build_hypervisor_args → spawn_hypervisor
//! ```
//!
//! A session owns exactly one VM; the caller decides whether to retry a
//! failed start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::LaunchOptions;
use super::handle::{VmHandle, VmStatus};
use super::lifecycle::{spawn_hypervisor, LaunchError};
use super::qemu::build_hypervisor_args;
use crate::bridge::{self, BridgeError, HostBridge};
use crate::config::SandvisorConfig;
use crate::metrics::VM_LAUNCH_DURATION;
use crate::protocol::{
    AgentRequest, ConfirmationMode, Heartbeat, IpcLayout, MountDescriptor, GUEST_IPC_DIR,
    GUEST_SKILLS_DIR, GUEST_WORK_DIR, IPC_TAG, MAX_SYNC_FILE_SIZE, SKILLS_TAG, WORK_TAG,
};
use crate::runtime::{prepare_session_firmware, Provisioner, RuntimeInfo, TransportKind};

const READY_POLL: Duration = Duration::from_millis(250);

/// What the caller wants in a session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: String,
    /// Host directory the agent works in
    pub work_dir: PathBuf,
    /// Read-only skills directory (shared-directory transport only)
    pub skills_dir: Option<PathBuf>,
}

impl SessionSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: Uuid::now_v7().to_string(),
            work_dir: work_dir.into(),
            skills_dir: None,
        }
    }

    pub fn with_skills_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.skills_dir = dir;
        self
    }
}

/// Pick the transport: a request is honored unless the hypervisor cannot serve it
pub fn select_transport(runtime: &RuntimeInfo, requested: Option<TransportKind>) -> TransportKind {
    let supported = if runtime.platform.supports_shared_dirs() {
        runtime.transport
    } else {
        TransportKind::Socket
    };
    match requested {
        Some(TransportKind::SharedFs) if supported == TransportKind::Socket => {
            warn!("shared directories unavailable on this host; using socket transport");
            TransportKind::Socket
        }
        Some(kind) => kind,
        None => supported,
    }
}

/// Mount descriptors for the shared-directory transport; none for socket
pub fn session_mounts(
    kind: TransportKind,
    ipc_dir: &Path,
    work_dir: &Path,
    skills_dir: Option<&Path>,
) -> Vec<MountDescriptor> {
    if kind == TransportKind::Socket {
        return Vec::new();
    }
    let mut mounts = vec![
        MountDescriptor::new(WORK_TAG, work_dir, GUEST_WORK_DIR),
        MountDescriptor::new(IPC_TAG, ipc_dir, GUEST_IPC_DIR),
    ];
    if let Some(skills) = skills_dir {
        mounts.push(MountDescriptor::new(SKILLS_TAG, skills, GUEST_SKILLS_DIR));
    }
    mounts
}

/// A running session VM and the bridge that talks to its guest daemon
pub struct SessionVm {
    handle: VmHandle,
    bridge: Arc<dyn HostBridge>,
    mounts: Vec<MountDescriptor>,
    work_dir: PathBuf,
    runtime: RuntimeInfo,
}

impl SessionVm {
    /// Provision (once), prepare the session directory, wire the bridge and launch
    pub async fn start(
        provisioner: &Provisioner,
        config: &SandvisorConfig,
        spec: SessionSpec,
    ) -> Result<Self, LaunchError> {
        let start_time = Instant::now();
        let runtime = provisioner.ensure_ready().await?;
        let vm_id = format!("vm-{}", Uuid::now_v7());

        let session_dir = config.sessions_dir().join(&spec.session_id);
        let ipc_dir = session_dir.join("ipc");
        for dir in [&session_dir, &spec.work_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| LaunchError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }

        let kind = select_transport(&runtime, config.vm.transport);
        let mounts = session_mounts(kind, &ipc_dir, &spec.work_dir, spec.skills_dir.as_deref());
        info!(vm_id = %vm_id, session_id = %spec.session_id, transport = ?kind, "creating session VM");

        let (bridge, wiring) =
            bridge::connect(kind, IpcLayout::new(&ipc_dir), spec.work_dir.clone()).await?;

        let mut options = LaunchOptions::new(&spec.session_id, &session_dir);
        options.memory_mib = config.vm.memory_mib;
        options.cpus = config.vm.cpus;
        options.accel = config.vm.accel;
        options.transport = wiring;
        options.firmware_vars = prepare_session_firmware(&runtime, &session_dir).await?;

        let args = build_hypervisor_args(&runtime, &mounts, &options);
        let process = match spawn_hypervisor(
            &runtime.hypervisor_binary,
            &args,
            &vm_id,
            &options.serial_log(),
        )
        .await
        {
            Ok(process) => process,
            Err(e) => {
                bridge.close().await;
                return Err(e);
            }
        };

        let handle = VmHandle::new(vm_id.clone(), spec.session_id, session_dir, kind, process);
        let elapsed = start_time.elapsed();
        VM_LAUNCH_DURATION.observe(elapsed.as_secs_f64());
        info!(vm_id = %vm_id, pid = ?handle.pid(), elapsed_ms = elapsed.as_millis() as u64, "hypervisor launched");

        Ok(Self {
            handle,
            bridge,
            mounts,
            work_dir: spec.work_dir,
            runtime,
        })
    }

    pub fn handle(&self) -> &VmHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut VmHandle {
        &mut self.handle
    }

    pub fn bridge(&self) -> Arc<dyn HostBridge> {
        self.bridge.clone()
    }

    pub fn transport(&self) -> TransportKind {
        self.handle.transport
    }

    pub fn mounts(&self) -> &[MountDescriptor] {
        &self.mounts
    }

    pub fn runtime(&self) -> &RuntimeInfo {
        &self.runtime
    }

    /// A request for this session with guest-side paths filled in
    pub fn new_request(&self, prompt: impl Into<String>) -> AgentRequest {
        AgentRequest {
            id: Uuid::now_v7().to_string(),
            cwd: PathBuf::from(GUEST_WORK_DIR),
            env: Default::default(),
            prompt: prompt.into(),
            session_id: None,
            system_prompt: None,
            mounts: self.mounts.clone(),
            workspace_root: PathBuf::from(GUEST_WORK_DIR),
            host_workspace_root: self.work_dir.clone(),
            confirmation_mode: ConfirmationMode::Modal,
        }
    }

    /// Wait for the guest daemon's first heartbeat
    ///
    /// Fails early if the hypervisor process dies while waiting.
    pub async fn wait_until_ready(&mut self, timeout: Duration) -> Result<Heartbeat, LaunchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(heartbeat) = self.bridge.read_heartbeat().await {
                self.handle.mark_running();
                info!(
                    vm_id = %self.handle.vm_id,
                    transport = ?heartbeat.transport,
                    status = ?heartbeat.status,
                    "guest daemon ready"
                );
                return Ok(heartbeat);
            }
            if let VmStatus::Failed(status) = self.handle.try_status().clone() {
                return Err(LaunchError::ExitedEarly {
                    status,
                    serial_log: self.handle.serial_log(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                self.handle.mark_failed("guest never reported a heartbeat".into());
                return Err(BridgeError::NotReady(timeout).into());
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Copy the host work dir into the guest (socket transport only)
    ///
    /// Shared-directory sessions see the work dir directly, so this is a
    /// no-op there. Returns the number of files pushed.
    pub async fn push_workspace(&self) -> Result<usize, LaunchError> {
        if self.transport() != TransportKind::Socket {
            return Ok(0);
        }
        let mut pushed = 0;
        for (relative, path) in workspace_files(&self.work_dir) {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|source| LaunchError::Io { path, source })?;
            self.bridge.push_file(&relative, &data).await?;
            pushed += 1;
        }
        debug!(vm_id = %self.handle.vm_id, pushed, "workspace pushed to guest");
        Ok(pushed)
    }

    /// Close the bridge and stop the hypervisor
    pub async fn stop(mut self) {
        self.bridge.close().await;
        self.handle.shutdown().await;
        info!(vm_id = %self.handle.vm_id, "session VM stopped");
    }
}

/// Regular files under `root` small enough to transfer, as (relative, absolute)
fn workspace_files(root: &Path) -> Vec<(String, PathBuf)> {
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let small = entry
                .metadata()
                .map(|m| m.len() <= MAX_SYNC_FILE_SIZE)
                .unwrap_or(false);
            if !small {
                warn!(path = %entry.path().display(), "skipping oversized workspace file");
            }
            small
        })
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(root).ok()?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some((relative, entry.path().to_path_buf()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Platform;

    fn runtime(os: &str, transport: TransportKind) -> RuntimeInfo {
        RuntimeInfo {
            platform: Platform::from_parts(os, "x86_64").unwrap(),
            hypervisor_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            disk_image: PathBuf::from("/base/images/1/disk.qcow2"),
            kernel: None,
            initrd: None,
            firmware_code: None,
            firmware_vars_template: None,
            transport,
            base_dir: PathBuf::from("/base"),
        }
    }

    #[test]
    fn test_transport_selection() {
        let linux = runtime("linux", TransportKind::SharedFs);
        assert_eq!(select_transport(&linux, None), TransportKind::SharedFs);
        assert_eq!(
            select_transport(&linux, Some(TransportKind::Socket)),
            TransportKind::Socket
        );

        let no_virtfs = runtime("linux", TransportKind::Socket);
        assert_eq!(
            select_transport(&no_virtfs, Some(TransportKind::SharedFs)),
            TransportKind::Socket
        );

        let windows = runtime("windows", TransportKind::SharedFs);
        assert_eq!(select_transport(&windows, None), TransportKind::Socket);
    }

    #[test]
    fn test_mounts_only_for_shared_dirs() {
        let ipc = Path::new("/s/ipc");
        let work = Path::new("/home/u/proj");
        let skills = Path::new("/opt/skills");

        let shared = session_mounts(TransportKind::SharedFs, ipc, work, Some(skills));
        let tags: Vec<_> = shared.iter().map(|m| m.tag.as_str()).collect();
        assert_eq!(tags, vec![WORK_TAG, IPC_TAG, SKILLS_TAG]);
        assert_eq!(shared[0].guest_path, PathBuf::from(GUEST_WORK_DIR));

        assert!(session_mounts(TransportKind::Socket, ipc, work, Some(skills)).is_empty());
    }

    #[test]
    fn test_workspace_files_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/raw")).unwrap();
        std::fs::write(dir.path().join("notes.md"), "n").unwrap();
        std::fs::write(dir.path().join("data/raw/a.csv"), "1,2").unwrap();

        let mut files: Vec<String> = workspace_files(dir.path())
            .into_iter()
            .map(|(rel, _)| rel)
            .collect();
        files.sort();
        assert_eq!(files, vec!["data/raw/a.csv", "notes.md"]);
    }
}
