//! Shared-directory bridge
//!
//! The ipc and work directories are 9p shares, so every operation is a
//! plain file write the guest daemon picks up by polling.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{BridgeError, HostBridge};
use crate::protocol::layout::write_atomic;
use crate::protocol::{
    resolve_within, AgentRequest, HostToolResponse, IpcLayout, PermissionResponse,
};
use crate::runtime::TransportKind;

pub struct FileBridge {
    layout: IpcLayout,
    work_dir: PathBuf,
}

impl FileBridge {
    /// Create the ipc skeleton and wrap it
    pub async fn open(layout: IpcLayout, work_dir: PathBuf) -> Result<Self, BridgeError> {
        layout.create_dirs().await?;
        Ok(Self { layout, work_dir })
    }
}

#[async_trait]
impl HostBridge for FileBridge {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedFs
    }

    fn layout(&self) -> &IpcLayout {
        &self.layout
    }

    async fn submit_request(&self, request: &AgentRequest) -> Result<(), BridgeError> {
        let path = self.layout.request_path(&request.id)?;
        write_atomic(&path, &serde_json::to_vec(request)?).await?;
        debug!(request_id = %request.id, "request submitted");
        Ok(())
    }

    async fn send_permission_response(
        &self,
        permission_id: &str,
        response: &PermissionResponse,
    ) -> Result<(), BridgeError> {
        let path = self.layout.permission_response_path(permission_id)?;
        write_atomic(&path, &serde_json::to_vec(response)?).await?;
        Ok(())
    }

    async fn send_host_tool_response(
        &self,
        tool_request_id: &str,
        response: &HostToolResponse,
    ) -> Result<(), BridgeError> {
        let path = self.layout.host_tool_response_path(tool_request_id)?;
        write_atomic(&path, &serde_json::to_vec(response)?).await?;
        Ok(())
    }

    async fn push_file(&self, relative_path: &str, data: &[u8]) -> Result<(), BridgeError> {
        let target = resolve_within(&self.work_dir, relative_path)?;
        write_atomic(&target, data).await?;
        Ok(())
    }
}
