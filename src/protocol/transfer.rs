//! Chunked file transfer over the line protocol
//!
//! Files up to [`SINGLE_MESSAGE_THRESHOLD`] travel as one message. Larger
//! files are cut into [`CHUNK_SIZE`] slices tagged with a transfer id and
//! closed by a complete marker:
//!
//! ```text
//! sender                                   receiver (TransferAssembler)
//!   ├── chunk {id, idx=2, total=4} ───────► slot 2
//!   ├── chunk {id, idx=0, total=4} ───────► slot 0
//!   ├── chunk {id, idx=3, total=4} ───────► slot 3
//!   ├── chunk {id, idx=1, total=4} ───────► slot 1
//!   └── complete {id, total=4}     ───────► all slots present → flush to disk
//! ```
//!
//! Arrival order does not matter. A transfer that sees no traffic for
//! [`TRANSFER_IDLE_TIMEOUT`] is dropped by [`TransferAssembler::collect_garbage`].
//!
//! The assembler only buffers; a finished file comes back as a [`ReadyFile`]
//! whose [`ReadyFile::write`] goes through `tokio::fs`, so callers can hold
//! the assembler lock without blocking on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::{FileChunk, FileComplete, FilePayload};
use super::paths::{resolve_within, PathTraversal};
use super::{CHUNK_SIZE, MAX_SYNC_FILE_SIZE, SINGLE_MESSAGE_THRESHOLD, TRANSFER_IDLE_TIMEOUT};
use crate::metrics::FILE_TRANSFERS;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    PathTraversal(#[from] PathTraversal),
    #[error("transfer `{transfer_id}` completed with missing chunks {missing:?}")]
    MissingChunks {
        transfer_id: String,
        missing: Vec<u32>,
    },
    #[error("chunk {index} out of range for transfer `{transfer_id}` ({total} chunks)")]
    ChunkOutOfRange {
        transfer_id: String,
        index: u32,
        total: u32,
    },
    #[error("transfer `{transfer_id}` announced {expected} chunks, then {got}")]
    TotalMismatch {
        transfer_id: String,
        expected: u32,
        got: u32,
    },
    #[error("transfer `{transfer_id}` exceeds {limit} bytes")]
    TooLarge { transfer_id: String, limit: u64 },
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Message sequence for one outbound file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFile {
    Single(FilePayload),
    Chunked {
        chunks: Vec<FileChunk>,
        complete: FileComplete,
    },
}

/// Split file content according to the single-message/chunk rule
pub fn split_file(relative_path: &str, data: &[u8]) -> OutboundFile {
    if data.len() <= SINGLE_MESSAGE_THRESHOLD {
        return OutboundFile::Single(FilePayload {
            path: relative_path.to_string(),
            data: BASE64.encode(data),
        });
    }

    let transfer_id = Uuid::now_v7().to_string();
    let total = data.len().div_ceil(CHUNK_SIZE) as u32;
    let chunks = data
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(index, slice)| FileChunk {
            transfer_id: transfer_id.clone(),
            path: relative_path.to_string(),
            chunk_index: index as u32,
            total_chunks: total,
            data: BASE64.encode(slice),
        })
        .collect();

    OutboundFile::Chunked {
        chunks,
        complete: FileComplete {
            transfer_id,
            path: relative_path.to_string(),
            total_chunks: total,
        },
    }
}

/// Fully received file content, validated against the root, not yet on disk
#[derive(Debug)]
pub struct ReadyFile {
    pub target: PathBuf,
    data: Vec<u8>,
    direction: &'static str,
}

impl ReadyFile {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write through a sibling temp file and rename, so readers never see half a file
    pub async fn write(self) -> Result<PathBuf, TransferError> {
        let target = self.target;
        let io_err = |source| TransferError::Io {
            path: target.clone(),
            source,
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(".{file_name}.sandvisor-part"));
        tokio::fs::write(&tmp, &self.data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &target).await.map_err(io_err)?;
        FILE_TRANSFERS
            .with_label_values(&[self.direction, "written"])
            .inc();
        Ok(target)
    }
}

struct InFlight {
    path: String,
    total: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: u64,
    last_activity: Instant,
}

impl InFlight {
    fn missing(&self) -> Vec<u32> {
        (0..self.total)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }
}

/// Receiver-side reassembly of chunked transfers into one root directory
pub struct TransferAssembler {
    root: PathBuf,
    direction: &'static str,
    idle_timeout: Duration,
    transfers: HashMap<String, InFlight>,
}

impl TransferAssembler {
    /// `direction` labels metrics ("inbound_sync" on the host, "push" in the guest)
    pub fn new(root: impl Into<PathBuf>, direction: &'static str) -> Self {
        Self {
            root: root.into(),
            direction,
            idle_timeout: TRANSFER_IDLE_TIMEOUT,
            transfers: HashMap::new(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Decode a single-message file
    pub fn accept_whole(&self, payload: &FilePayload) -> Result<ReadyFile, TransferError> {
        let target = resolve_within(&self.root, &payload.path)?;
        let data = BASE64.decode(payload.data.as_bytes())?;
        Ok(self.ready(target, data))
    }

    fn ready(&self, target: PathBuf, data: Vec<u8>) -> ReadyFile {
        ReadyFile {
            target,
            data,
            direction: self.direction,
        }
    }

    fn abandon(&mut self, transfer_id: &str) {
        if self.transfers.remove(transfer_id).is_some() {
            FILE_TRANSFERS
                .with_label_values(&[self.direction, "abandoned"])
                .inc();
        }
    }

    /// Store one chunk; chunks may arrive in any order
    pub fn accept_chunk(&mut self, chunk: &FileChunk) -> Result<(), TransferError> {
        // Validate the destination up front so a hostile transfer never buffers
        resolve_within(&self.root, &chunk.path)?;
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                transfer_id: chunk.transfer_id.clone(),
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }
        let data = BASE64.decode(chunk.data.as_bytes())?;

        let entry = self
            .transfers
            .entry(chunk.transfer_id.clone())
            .or_insert_with(|| InFlight {
                path: chunk.path.clone(),
                total: chunk.total_chunks,
                chunks: BTreeMap::new(),
                bytes: 0,
                last_activity: Instant::now(),
            });
        if entry.total != chunk.total_chunks {
            let expected = entry.total;
            self.abandon(&chunk.transfer_id);
            return Err(TransferError::TotalMismatch {
                transfer_id: chunk.transfer_id.clone(),
                expected,
                got: chunk.total_chunks,
            });
        }
        entry.last_activity = Instant::now();
        entry.bytes += data.len() as u64;
        if entry.bytes > MAX_SYNC_FILE_SIZE {
            self.transfers.remove(&chunk.transfer_id);
            return Err(TransferError::TooLarge {
                transfer_id: chunk.transfer_id.clone(),
                limit: MAX_SYNC_FILE_SIZE,
            });
        }
        entry.chunks.insert(chunk.chunk_index, data);
        Ok(())
    }

    /// Handle the end marker
    ///
    /// Assembles the file when every chunk index is present. If any is
    /// missing, or the marker disagrees on the chunk count, the transfer is
    /// abandoned.
    pub fn accept_complete(&mut self, complete: &FileComplete) -> Result<ReadyFile, TransferError> {
        let Some(entry) = self.transfers.get(&complete.transfer_id) else {
            if complete.total_chunks == 0 {
                let target = resolve_within(&self.root, &complete.path)?;
                return Ok(self.ready(target, Vec::new()));
            }
            return Err(TransferError::MissingChunks {
                transfer_id: complete.transfer_id.clone(),
                missing: (0..complete.total_chunks).collect(),
            });
        };

        if entry.total != complete.total_chunks {
            let expected = entry.total;
            self.abandon(&complete.transfer_id);
            return Err(TransferError::TotalMismatch {
                transfer_id: complete.transfer_id.clone(),
                expected,
                got: complete.total_chunks,
            });
        }

        let missing = entry.missing();
        if missing.is_empty() {
            return self.assemble(&complete.transfer_id);
        }

        self.abandon(&complete.transfer_id);
        Err(TransferError::MissingChunks {
            transfer_id: complete.transfer_id.clone(),
            missing,
        })
    }

    /// Drop transfers idle for longer than the idle timeout
    pub fn collect_garbage(&mut self) -> usize {
        let idle_timeout = self.idle_timeout;
        let before = self.transfers.len();
        self.transfers.retain(|id, t| {
            let keep = t.last_activity.elapsed() < idle_timeout;
            if !keep {
                warn!(transfer_id = %id, path = %t.path, received = t.chunks.len(), total = t.total, "abandoning idle transfer");
            }
            keep
        });
        let dropped = before - self.transfers.len();
        if dropped > 0 {
            FILE_TRANSFERS
                .with_label_values(&[self.direction, "expired"])
                .inc_by(dropped as u64);
        }
        dropped
    }

    fn assemble(&mut self, transfer_id: &str) -> Result<ReadyFile, TransferError> {
        let Some(transfer) = self.transfers.remove(transfer_id) else {
            return Err(TransferError::MissingChunks {
                transfer_id: transfer_id.to_string(),
                missing: Vec::new(),
            });
        };
        let target = resolve_within(&self.root, &transfer.path)?;
        let mut content = Vec::with_capacity(transfer.bytes as usize);
        for (_, chunk) in transfer.chunks {
            content.extend_from_slice(&chunk);
        }
        debug!(transfer_id, path = %target.display(), bytes = content.len(), "transfer assembled");
        Ok(self.ready(target, content))
    }
}
