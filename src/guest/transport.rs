//! Guest side of the control channel
//!
//! The daemon talks to one `GuestTransport`, chosen by the probe:
//!
//! ```text
//!                 ┌──────────────────────────────────┐
//!   Daemon ──────►│        dyn GuestTransport        │
//!                 ├────────────────┬─────────────────┤
//!                 │ FileTransport  │ SocketTransport │
//!                 │ (ipc share or  │ (virtio-serial  │
//!                 │  degraded dir) │  line JSON)     │
//!                 └────────────────┴─────────────────┘
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    AgentRequest, Heartbeat, HostToolRequest, HostToolResponse, PendingOutcome,
    PermissionRequest, PermissionResponse, StreamEvent, TransportMode,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport is closed")]
    Closed,
}

#[async_trait]
pub trait GuestTransport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Wait for the next request not yet handed out
    ///
    /// Cancel-safe. `None` means the transport is gone and the daemon
    /// should probe again.
    async fn next_request(&self) -> Option<AgentRequest>;

    /// Append an event to `request_id`'s stream
    async fn emit(&self, request_id: &str, event: &StreamEvent) -> Result<(), TransportError>;

    /// Emit a permission request on `request_id`'s stream and wait for the answer
    async fn await_permission(
        &self,
        request_id: &str,
        permission: PermissionRequest,
        cancel: &CancellationToken,
    ) -> PendingOutcome<PermissionResponse>;

    /// Emit a host-tool request on `request_id`'s stream and wait for the answer
    async fn await_host_tool(
        &self,
        request_id: &str,
        call: HostToolRequest,
        cancel: &CancellationToken,
    ) -> PendingOutcome<HostToolResponse>;

    async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), TransportError>;

    /// Mark a request as processed so it is never handed out again
    async fn acknowledge(&self, request_id: &str);

    /// Send changed work-dir files to the host; all files when `force`
    ///
    /// Returns the number of files sent. A no-op where the work dir is shared.
    async fn sync_files(&self, force: bool) -> usize;

    /// Whether the host-side ipc share is visible
    fn ipc_mounted(&self) -> bool;
}
