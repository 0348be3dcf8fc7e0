//! sandvisor - run an AI agent's tool calls inside a local QEMU sandbox
//!
//! The host provisions a hypervisor runtime, launches one VM per session and
//! talks to a daemon inside the guest over shared directories or a
//! virtio-serial port. The guest daemon drives the agent engine and gates
//! every tool call through the safety policy.
//!
//! # Modules
//!
//! - `runtime` - download, verify and extract the hypervisor and images
//! - `vm` - QEMU argument building and process lifecycle
//! - `bridge` - host side of the control channel (file or socket)
//! - `session` - one agent turn over a bridge, plus host tools
//! - `guest` - the daemon running inside the VM
//! - `policy` - delete and workspace-boundary classification
//! - `protocol` - wire messages, ipc layout, chunked transfers
//! - `config` - host configuration (TOML + env)
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use sandvisor::{config::SandvisorConfig, runtime::Provisioner, vm::{SessionSpec, SessionVm}};
//!
//! let config = SandvisorConfig::load(None)?;
//! let provisioner = Provisioner::new(config.runtime.clone());
//! let mut vm = SessionVm::start(&provisioner, &config, SessionSpec::new("/work")).await?;
//! vm.wait_until_ready(config.bridge.ready_timeout()).await?;
//! ```

pub mod bridge;
pub mod config;
pub mod guest;
pub mod metrics;
pub mod policy;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod tracing;
pub mod vm;

pub use config::SandvisorConfig;
pub use runtime::{Provisioner, RuntimeInfo};
pub use vm::{SessionSpec, SessionVm};
