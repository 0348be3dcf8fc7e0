//! Guest daemon: runs inside the VM, executes agent turns for the host
//!
//! - `probe` - picks the shared-mount, serial or degraded transport
//! - `file_transport` / `socket_transport` - the two `GuestTransport`s
//! - `daemon` - main loop, heartbeat, sync timer and request processing
//! - `engine` - the agent engine seam and the child-process engine
//! - `gate` - tool gate in front of every engine tool call
//! - `normalize` / `env` - host-to-guest paths and subprocess environment
//! - `sync` - working-directory change scanner for socket mode

pub mod config;
pub mod daemon;
pub mod engine;
pub mod env;
pub mod file_transport;
pub mod gate;
pub mod normalize;
pub mod probe;
pub mod socket_transport;
pub mod sync;
pub mod transport;

pub use config::{DaemonConfig, TransportChoice};
pub use daemon::{Daemon, DaemonError};
pub use engine::{AgentEngine, EngineCallbacks, EngineError, EngineInvocation, ProcessEngine};
pub use file_transport::FileTransport;
pub use gate::{PermissionAsker, ToolDecision, ToolGate};
pub use probe::{probe_transport, ProbeOutcome, ProbeState};
pub use socket_transport::SocketTransport;
pub use transport::{GuestTransport, TransportError};
