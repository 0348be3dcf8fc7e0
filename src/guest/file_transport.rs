//! File-polling transport over the ipc share
//!
//! Requests are picked up from `requests/`, responses are polled from
//! `responses/` and deleted once read. Also used in degraded mode, where
//! the directory is local and only the heartbeat is meaningful.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transport::{GuestTransport, TransportError};
use crate::protocol::layout::remove_if_exists;
use crate::protocol::{
    AgentRequest, Heartbeat, HostToolRequest, HostToolResponse, IpcLayout, PendingOutcome,
    PermissionRequest, PermissionResponse, StreamEvent, TransportMode,
};

pub struct FileTransport {
    layout: IpcLayout,
    mode: TransportMode,
    request_poll: Duration,
    response_poll: Duration,
    timeout: Duration,
    /// Requests handed out but not yet acknowledged
    claimed: Mutex<HashSet<String>>,
}

impl FileTransport {
    /// Ensure the ipc skeleton exists and wrap it
    ///
    /// # Arguments
    /// * `mode` - `File` over the share, `Degraded` for the local fallback
    pub async fn open(
        layout: IpcLayout,
        mode: TransportMode,
        request_poll: Duration,
        response_poll: Duration,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        layout.create_dirs().await?;
        Ok(Self {
            layout,
            mode,
            request_poll,
            response_poll,
            timeout,
            claimed: Mutex::new(HashSet::new()),
        })
    }

    pub fn layout(&self) -> &IpcLayout {
        &self.layout
    }

    fn claimed(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One pass over the requests directory
    async fn take_pending(&self) -> Option<AgentRequest> {
        let ids = match self.layout.pending_request_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                debug!(error = %e, "requests directory unreadable");
                return None;
            }
        };
        for id in ids {
            if self.claimed().contains(&id) {
                continue;
            }
            let Ok(path) = self.layout.request_path(&id) else {
                continue;
            };
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Raced with acknowledge or host cleanup
                Err(_) => continue,
            };
            match serde_json::from_slice::<AgentRequest>(&bytes) {
                Ok(request) if request.id == id => {
                    self.claimed().insert(id);
                    return Some(request);
                }
                Ok(request) => {
                    warn!(file_id = %id, request_id = %request.id, "request id does not match file name; discarding");
                    let _ = remove_if_exists(&path).await;
                }
                Err(e) => {
                    warn!(request_id = %id, error = %e, "malformed request file; discarding");
                    let _ = remove_if_exists(&path).await;
                }
            }
        }
        None
    }

    /// Poll for `path` until it parses, the timeout passes, or `cancel` fires
    async fn poll_response<T: DeserializeOwned>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> PendingOutcome<T> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Ok(bytes) = tokio::fs::read(path).await {
                match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => {
                        if let Err(e) = remove_if_exists(path).await {
                            warn!(path = %path.display(), error = %e, "failed to remove response file");
                        }
                        return PendingOutcome::Resolved(value);
                    }
                    Err(e) => debug!(path = %path.display(), error = %e, "response not readable yet"),
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return PendingOutcome::TimedOut;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PendingOutcome::Cancelled,
                _ = tokio::time::sleep(self.response_poll) => {}
            }
        }
    }
}

#[async_trait]
impl GuestTransport for FileTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    async fn next_request(&self) -> Option<AgentRequest> {
        if self.mode == TransportMode::Degraded {
            // Nobody can write requests here; park until the daemon re-probes
            std::future::pending::<()>().await;
        }
        loop {
            if let Some(request) = self.take_pending().await {
                return Some(request);
            }
            tokio::time::sleep(self.request_poll).await;
        }
    }

    async fn emit(&self, request_id: &str, event: &StreamEvent) -> Result<(), TransportError> {
        self.layout.append_stream_event(request_id, event).await?;
        Ok(())
    }

    async fn await_permission(
        &self,
        request_id: &str,
        permission: PermissionRequest,
        cancel: &CancellationToken,
    ) -> PendingOutcome<PermissionResponse> {
        let path = match self.layout.permission_response_path(&permission.request_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "invalid permission id");
                return PendingOutcome::Cancelled;
            }
        };
        if let Err(e) = self
            .emit(request_id, &StreamEvent::PermissionRequest(permission))
            .await
        {
            warn!(request_id, error = %e, "failed to emit permission request");
            return PendingOutcome::Cancelled;
        }
        self.poll_response(&path, cancel).await
    }

    async fn await_host_tool(
        &self,
        request_id: &str,
        call: HostToolRequest,
        cancel: &CancellationToken,
    ) -> PendingOutcome<HostToolResponse> {
        let path = match self.layout.host_tool_response_path(&call.request_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "invalid host tool request id");
                return PendingOutcome::Cancelled;
            }
        };
        if let Err(e) = self
            .emit(request_id, &StreamEvent::HostToolRequest(call))
            .await
        {
            warn!(request_id, error = %e, "failed to emit host tool request");
            return PendingOutcome::Cancelled;
        }
        self.poll_response(&path, cancel).await
    }

    async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), TransportError> {
        self.layout.write_heartbeat(heartbeat).await?;
        Ok(())
    }

    async fn acknowledge(&self, request_id: &str) {
        if let Ok(path) = self.layout.request_path(request_id) {
            if let Err(e) = remove_if_exists(&path).await {
                warn!(request_id, error = %e, "failed to delete processed request");
            }
        }
        self.claimed().remove(request_id);
    }

    async fn sync_files(&self, _force: bool) -> usize {
        0
    }

    fn ipc_mounted(&self) -> bool {
        self.mode == TransportMode::File && self.layout.is_present()
    }
}
