//! Hypervisor launch configuration
//!
//! These types describe one session VM; `qemu::build_hypervisor_args` turns
//! them into a command line.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::runtime::{HostOs, Platform};

/// Acceleration backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accel {
    /// Linux KVM
    Kvm,
    /// macOS Hypervisor.framework
    Hvf,
    /// Windows Hypervisor Platform
    Whpx,
    /// Software emulation
    Tcg,
}

impl Accel {
    /// Native backend for the host OS, software emulation when unavailable
    ///
    /// # Arguments
    /// * `kvm_available` - whether `/dev/kvm` is usable (Linux only)
    pub fn default_for(platform: &Platform, kvm_available: bool) -> Self {
        match platform.os {
            HostOs::Linux if kvm_available => Accel::Kvm,
            HostOs::Linux => Accel::Tcg,
            HostOs::Macos => Accel::Hvf,
            HostOs::Windows => Accel::Whpx,
        }
    }

    /// Detect for the running host
    pub fn detect(platform: &Platform) -> Self {
        Self::default_for(platform, Path::new("/dev/kvm").exists())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Accel::Kvm => "kvm",
            Accel::Hvf => "hvf",
            Accel::Whpx => "whpx",
            Accel::Tcg => "tcg",
        }
    }

    /// Whether `-cpu host` can be used with this backend
    pub fn supports_host_cpu(&self) -> bool {
        matches!(self, Accel::Kvm | Accel::Hvf)
    }
}

impl FromStr for Accel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kvm" => Ok(Accel::Kvm),
            "hvf" => Ok(Accel::Hvf),
            "whpx" => Ok(Accel::Whpx),
            "tcg" => Ok(Accel::Tcg),
            other => Err(format!("unknown accelerator `{other}`")),
        }
    }
}

/// How the control channel is attached to the VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportWiring {
    /// One 9p share per mount descriptor
    SharedDirs,
    /// virtio-serial port backed by a host TCP listener on 127.0.0.1
    Socket { port: u16 },
}

/// Per-session launch options
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub session_id: String,
    /// Holds the serial log and the per-session firmware vars copy
    pub session_dir: PathBuf,
    pub memory_mib: u32,
    pub cpus: u32,
    /// Override for the per-OS default backend
    pub accel: Option<Accel>,
    pub transport: TransportWiring,
    /// Per-session firmware variables (firmware boot only)
    pub firmware_vars: Option<PathBuf>,
    /// User-mode networking for the guest
    pub network: bool,
}

impl LaunchOptions {
    pub fn new(session_id: impl Into<String>, session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            session_dir: session_dir.into(),
            memory_mib: 4096,
            cpus: 2,
            accel: None,
            transport: TransportWiring::SharedDirs,
            firmware_vars: None,
            network: true,
        }
    }

    pub fn serial_log(&self) -> PathBuf {
        self.session_dir.join("serial.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_accel_per_os() {
        let linux = Platform::from_parts("linux", "x86_64").unwrap();
        assert_eq!(Accel::default_for(&linux, true), Accel::Kvm);
        assert_eq!(Accel::default_for(&linux, false), Accel::Tcg);
        let mac = Platform::from_parts("macos", "aarch64").unwrap();
        assert_eq!(Accel::default_for(&mac, false), Accel::Hvf);
        let win = Platform::from_parts("windows", "x86_64").unwrap();
        assert_eq!(Accel::default_for(&win, false), Accel::Whpx);
    }

    #[test]
    fn test_accel_parse() {
        assert_eq!("KVM".parse::<Accel>(), Ok(Accel::Kvm));
        assert!("xen".parse::<Accel>().is_err());
    }
}
