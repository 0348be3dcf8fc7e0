//! Host side of the control channel
//!
//! One interface, two wire transports, picked once when the session starts:
//!
//! ```text
//!                    ┌────────────────────────────┐
//!   SessionDriver ──►│   dyn HostBridge           │
//!                    ├──────────────┬─────────────┤
//!                    │ FileBridge   │ SocketBridge│
//!                    │ (9p shares,  │ (TCP ⇄      │
//!                    │  polling)    │  virtio-    │
//!                    │              │  serial)    │
//!                    └──────┬───────┴──────┬──────┘
//!                           ▼              ▼
//!                  <ipc>/streams, heartbeat  (socket mirrors guest lines here)
//! ```
//!
//! Both implementations keep the same host-side ipc layout, so stream and
//! heartbeat reads are shared.

pub mod file;
pub mod liveness;
pub mod socket;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileBridge;
pub use liveness::{HeartbeatMonitor, Liveness};
pub use socket::SocketBridge;

use crate::protocol::{
    AgentRequest, Heartbeat, HostToolResponse, IpcLayout, PathTraversal, PermissionResponse,
    StreamRead,
};
use crate::runtime::TransportKind;
use crate::vm::TransportWiring;

const READY_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    PathTraversal(#[from] PathTraversal),

    #[error("guest did not report a heartbeat within {0:?}")]
    NotReady(Duration),

    #[error("bridge is closed")]
    Closed,
}

/// Host-side operations on a session's control channel
#[async_trait]
pub trait HostBridge: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Host-side ipc directory (streams and heartbeat live here in both modes)
    fn layout(&self) -> &IpcLayout;

    async fn submit_request(&self, request: &AgentRequest) -> Result<(), BridgeError>;

    /// Answer the permission exchange `permission_id`
    async fn send_permission_response(
        &self,
        permission_id: &str,
        response: &PermissionResponse,
    ) -> Result<(), BridgeError>;

    /// Answer the host-tool call `tool_request_id`
    async fn send_host_tool_response(
        &self,
        tool_request_id: &str,
        response: &HostToolResponse,
    ) -> Result<(), BridgeError>;

    /// Place a file in the guest's working directory
    async fn push_file(&self, relative_path: &str, data: &[u8]) -> Result<(), BridgeError>;

    /// Complete stream events for `request_id` from `offset` on
    async fn read_stream(&self, request_id: &str, offset: u64) -> Result<StreamRead, BridgeError> {
        Ok(self.layout().read_stream(request_id, offset).await?)
    }

    async fn read_heartbeat(&self) -> Option<Heartbeat> {
        self.layout().read_heartbeat().await
    }

    /// Wait for the first heartbeat
    async fn wait_until_ready(&self, timeout: Duration) -> Result<Heartbeat, BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(heartbeat) = self.read_heartbeat().await {
                return Ok(heartbeat);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::NotReady(timeout));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Stop background tasks; default is a no-op
    async fn close(&self) {}
}

/// Build the bridge for `kind` and the matching VM wiring
///
/// The socket listener is bound here, before the VM is launched, so the
/// hypervisor can connect as soon as it starts.
pub async fn connect(
    kind: TransportKind,
    layout: IpcLayout,
    work_dir: PathBuf,
) -> Result<(Arc<dyn HostBridge>, TransportWiring), BridgeError> {
    match kind {
        TransportKind::SharedFs => {
            let bridge = FileBridge::open(layout, work_dir).await?;
            Ok((Arc::new(bridge), TransportWiring::SharedDirs))
        }
        TransportKind::Socket => {
            let bridge = SocketBridge::bind(layout, work_dir).await?;
            let wiring = TransportWiring::Socket { port: bridge.port() };
            Ok((Arc::new(bridge), wiring))
        }
    }
}
