//! Wire and on-disk message types shared by host and guest
//!
//! All JSON uses camelCase field names. Tagged unions carry a snake_case
//! `type` discriminator so both sides can dispatch on a single field.
//!
//! ```text
//! host ──HostMessage──►  guest        (socket mode, one JSON object per line)
//! host ◄──GuestMessage── guest
//!
//! <ipcRoot>/streams/<id>.log          (both modes, one StreamEvent per line)
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directory shared between host and guest (file transport only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountDescriptor {
    /// Device tag the guest mounts by ("work", "ipc", "skills")
    pub tag: String,
    /// Absolute path on the host
    pub host_path: PathBuf,
    /// Where the guest mounts the share
    pub guest_path: PathBuf,
}

impl MountDescriptor {
    pub fn new(
        tag: impl Into<String>,
        host_path: impl Into<PathBuf>,
        guest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tag: tag.into(),
            host_path: host_path.into(),
            guest_path: guest_path.into(),
        }
    }
}

/// How the host UI should present confirmation prompts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    #[default]
    Modal,
    Text,
}

/// One agent turn submitted by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub id: String,
    /// Working directory as seen by the guest
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub prompt: String,
    /// Engine session to resume, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub mounts: Vec<MountDescriptor>,
    /// Workspace root inside the guest
    pub workspace_root: PathBuf,
    /// The same workspace as the host sees it
    pub host_workspace_root: PathBuf,
    #[serde(default)]
    pub confirmation_mode: ConfirmationMode,
}

impl AgentRequest {
    /// Guest path of the skills mount, if one was declared
    pub fn skills_root(&self) -> Option<&PathBuf> {
        self.mounts
            .iter()
            .find(|m| m.tag == super::SKILLS_TAG)
            .map(|m| &m.guest_path)
    }
}

/// Permission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Allow,
    Deny,
}

/// Guest asks the host whether a tool call may proceed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Unique id of this permission exchange
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(default)]
    pub confirmation_mode: ConfirmationMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub behavior: Behavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResponse {
    pub fn allow(updated_input: Option<Value>) -> Self {
        Self {
            behavior: Behavior::Allow,
            updated_input,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.behavior == Behavior::Allow
    }
}

/// Guest asks the host to run a capability it lacks locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostToolRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostToolResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// One entry of a request's stream log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Engine event forwarded verbatim
    SdkEvent { event: Value },
    PermissionRequest(PermissionRequest),
    HostToolRequest(HostToolRequest),
}

impl StreamEvent {
    pub fn sdk(event: Value) -> Self {
        StreamEvent::SdkEvent { event }
    }

    /// Terminal error event emitted when the engine fails
    pub fn engine_error(message: impl Into<String>) -> Self {
        StreamEvent::SdkEvent {
            event: serde_json::json!({
                "type": "result",
                "subtype": "error",
                "is_error": true,
                "error": message.into(),
            }),
        }
    }

    /// A `result` engine event closes the request's stream
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::SdkEvent { event } => {
                event.get("type").and_then(Value::as_str) == Some("result")
            }
            _ => false,
        }
    }
}

/// Transport the daemon ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    File,
    Socket,
    /// No usable request transport; liveness only
    Degraded,
}

/// Daemon health as reported in the heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Ready,
    Degraded,
}

/// Liveness probe, overwritten every heartbeat interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Milliseconds since the Unix epoch (guest clock)
    pub timestamp: u64,
    pub pid: u32,
    /// Seconds since the daemon started
    pub uptime: u64,
    pub ipc_mounted: bool,
    pub transport: TransportMode,
    pub status: DaemonStatus,
}

/// Whole file in one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    /// Path relative to the working directory
    pub path: String,
    /// Base64 file content
    pub data: String,
}

/// One slice of a chunked transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub transfer_id: String,
    pub path: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Base64 chunk content
    pub data: String,
}

/// End marker of a chunked transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileComplete {
    pub transfer_id: String,
    pub path: String,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    pub request_id: String,
    pub event: StreamEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReply {
    /// Id of the permission exchange being answered
    pub request_id: String,
    pub response: PermissionResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostToolReply {
    pub request_id: String,
    pub response: HostToolResponse,
}

/// Guest → host line messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    Heartbeat(Heartbeat),
    Stream(StreamEnvelope),
    FileSync(FilePayload),
    FileSyncChunk(FileChunk),
    FileSyncComplete(FileComplete),
}

/// Host → guest line messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Request(AgentRequest),
    PermissionResponse(PermissionReply),
    HostToolResponse(HostToolReply),
    PushFile(FilePayload),
    PushFileChunk(FileChunk),
    PushFileComplete(FileComplete),
}

/// Serialize a message as one newline-terminated JSON line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (with or without its trailing newline)
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end_matches(['\r', '\n']))
}
