//! IPC directory layout
//!
//! ```text
//!   <ipc>/requests/<id>.json              host → guest, deleted once processed
//!   <ipc>/responses/<id>.json             permission response
//!   <ipc>/responses/<id>.host-tool.json   host-tool response
//!   <ipc>/streams/<id>.log                append-only JSON lines, guest → host
//!   <ipc>/heartbeat                       overwritten JSON object
//! ```
//!
//! Whole-file writes go through a dot-prefixed temp file and a rename, so a
//! poller never sees a half-written request or response.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use super::messages::{Heartbeat, StreamEvent};

pub const REQUESTS_DIR: &str = "requests";
pub const RESPONSES_DIR: &str = "responses";
pub const STREAMS_DIR: &str = "streams";
pub const HEARTBEAT_FILE: &str = "heartbeat";

const HOST_TOOL_SUFFIX: &str = ".host-tool.json";

/// Complete events read from a stream log, and where to resume
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRead {
    pub events: Vec<StreamEvent>,
    pub next_offset: u64,
}

/// Reject ids that would escape their directory when used as file names
///
/// Dots are refused too: `x.host-tool` as a permission id would share a
/// response file with host-tool id `x`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn invalid_id(id: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("invalid id `{id}`"))
}

#[derive(Debug, Clone)]
pub struct IpcLayout {
    root: PathBuf,
}

impl IpcLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root.join(REQUESTS_DIR)
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.root.join(RESPONSES_DIR)
    }

    pub fn streams_dir(&self) -> PathBuf {
        self.root.join(STREAMS_DIR)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.root.join(HEARTBEAT_FILE)
    }

    pub fn request_path(&self, id: &str) -> io::Result<PathBuf> {
        self.id_path(REQUESTS_DIR, id, ".json")
    }

    pub fn permission_response_path(&self, id: &str) -> io::Result<PathBuf> {
        self.id_path(RESPONSES_DIR, id, ".json")
    }

    pub fn host_tool_response_path(&self, id: &str) -> io::Result<PathBuf> {
        self.id_path(RESPONSES_DIR, id, HOST_TOOL_SUFFIX)
    }

    pub fn stream_path(&self, id: &str) -> io::Result<PathBuf> {
        self.id_path(STREAMS_DIR, id, ".log")
    }

    fn id_path(&self, dir: &str, id: &str, suffix: &str) -> io::Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(invalid_id(id));
        }
        Ok(self.root.join(dir).join(format!("{id}{suffix}")))
    }

    /// Create the directory skeleton
    pub async fn create_dirs(&self) -> io::Result<()> {
        for dir in [self.requests_dir(), self.responses_dir(), self.streams_dir()] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Whether the skeleton exists (used by the guest to detect the ipc mount)
    pub fn is_present(&self) -> bool {
        self.requests_dir().is_dir() && self.responses_dir().is_dir()
    }

    /// Ids of pending request files, oldest first by name
    pub async fn pending_request_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.requests_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                if is_valid_id(id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> io::Result<()> {
        let body = serde_json::to_vec(heartbeat).map_err(io::Error::other)?;
        write_atomic(&self.heartbeat_path(), &body).await
    }

    /// Latest heartbeat, `None` when missing or mid-replacement
    pub async fn read_heartbeat(&self) -> Option<Heartbeat> {
        let bytes = tokio::fs::read(self.heartbeat_path()).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Append one event to a request's stream log
    pub async fn append_stream_event(&self, request_id: &str, event: &StreamEvent) -> io::Result<()> {
        let path = self.stream_path(request_id)?;
        let line = super::encode_line(event).map_err(io::Error::other)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Read complete lines of a stream log starting at `offset`
    ///
    /// A trailing line without its newline is left for the next call.
    /// Undecodable lines are skipped with a warning.
    pub async fn read_stream(&self, request_id: &str, offset: u64) -> io::Result<StreamRead> {
        let path = self.stream_path(request_id)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(StreamRead {
                    events: Vec::new(),
                    next_offset: offset,
                })
            }
            Err(e) => return Err(e),
        };
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let consumed = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        let mut events = Vec::new();
        for line in buf[..consumed].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<StreamEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(request_id, error = %e, "skipping malformed stream line"),
            }
        }
        Ok(StreamRead {
            events,
            next_offset: offset + consumed as u64,
        })
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?
        .to_string_lossy()
        .into_owned();
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
