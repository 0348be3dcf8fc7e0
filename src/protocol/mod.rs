//! Host ↔ guest control protocol
//!
//! Shared by the host bridge and the guest daemon:
//! - `messages` - request/stream/permission/heartbeat types and line codec
//! - `pending` - bounded-wait registry for responses keyed by id
//! - `transfer` - chunked file transfer and reassembly
//! - `paths` - containment guard for peer-supplied paths
//! - `layout` - ipc directory layout shared by file transport and mirrors

pub mod layout;
pub mod messages;
pub mod paths;
pub mod pending;
pub mod transfer;

use std::time::Duration;

pub use layout::{IpcLayout, StreamRead};
pub use messages::*;
pub use paths::{resolve_within, PathTraversal};
pub use pending::{PendingOutcome, PendingRegistry};
pub use transfer::{split_file, OutboundFile, ReadyFile, TransferAssembler, TransferError};

/// Size of one chunk of a multi-message transfer
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Files up to this size are sent as a single message
pub const SINGLE_MESSAGE_THRESHOLD: usize = 512 * 1024;

/// Larger files are skipped by working-directory sync
pub const MAX_SYNC_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Bounded wait for permission and host-tool responses
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Chunked transfers with no traffic for this long are discarded
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the guest daemon overwrites its heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// virtio-serial port name the guest looks for
pub const DEVICE_NAME: &str = "org.sandvisor.ipc";

/// Mount tags the guest daemon expects
pub const WORK_TAG: &str = "work";
pub const IPC_TAG: &str = "ipc";
pub const SKILLS_TAG: &str = "skills";

/// Default guest mount points for the shares above
pub const GUEST_WORK_DIR: &str = "/workspace";
pub const GUEST_IPC_DIR: &str = "/mnt/ipc";
pub const GUEST_SKILLS_DIR: &str = "/mnt/skills";
