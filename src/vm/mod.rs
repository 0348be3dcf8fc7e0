//! Session VM management
//!
//! This module turns a provisioned runtime into a running QEMU process:
//! - Launch configuration (accelerator, resources, transport wiring)
//! - Command-line construction
//! - Process lifecycle (spawn, status, shutdown)
//! - `SessionVm`, which ties a VM to its host bridge

pub mod config;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod qemu;

pub use config::{Accel, LaunchOptions, TransportWiring};
pub use handle::{VmHandle, VmStatus};
pub use lifecycle::{spawn_hypervisor, LaunchError};
pub use manager::{select_transport, session_mounts, SessionSpec, SessionVm};
pub use qemu::build_hypervisor_args;
