//! Host platform detection and the supported OS/arch matrix

use std::fmt;

use serde::Serialize;

use super::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOs {
    Linux,
    Macos,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostArch {
    X86_64,
    Aarch64,
}

/// A supported host OS/arch combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub os: HostOs,
    pub arch: HostArch,
}

impl Platform {
    /// Platform of the running process
    pub fn detect() -> Result<Self, ProvisionError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Validate an OS/arch pair using `std::env::consts` spelling
    pub fn from_parts(os: &str, arch: &str) -> Result<Self, ProvisionError> {
        let unsupported = || ProvisionError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        let host_os = match os {
            "linux" => HostOs::Linux,
            "macos" => HostOs::Macos,
            "windows" => HostOs::Windows,
            _ => return Err(unsupported()),
        };
        let host_arch = match arch {
            "x86_64" => HostArch::X86_64,
            "aarch64" => HostArch::Aarch64,
            _ => return Err(unsupported()),
        };
        if host_os == HostOs::Windows && host_arch == HostArch::Aarch64 {
            return Err(unsupported());
        }
        Ok(Self {
            os: host_os,
            arch: host_arch,
        })
    }

    /// File name of the system emulator for this arch
    pub fn hypervisor_binary_name(&self) -> String {
        let arch = match self.arch {
            HostArch::X86_64 => "x86_64",
            HostArch::Aarch64 => "aarch64",
        };
        match self.os {
            HostOs::Windows => format!("qemu-system-{arch}.exe"),
            _ => format!("qemu-system-{arch}"),
        }
    }

    /// Whether the hypervisor build for this OS can pass host directories through
    pub fn supports_shared_dirs(&self) -> bool {
        !matches!(self.os, HostOs::Windows)
    }

    /// Whether a kernel + initrd can be booted directly
    pub fn supports_direct_boot(&self) -> bool {
        match self.arch {
            HostArch::X86_64 => true,
            HostArch::Aarch64 => self.os == HostOs::Linux,
        }
    }

    /// aarch64 guests cannot boot a disk without UEFI firmware
    pub fn requires_firmware(&self) -> bool {
        self.arch == HostArch::Aarch64
    }

    /// Directories where an OS-installed hypervisor usually lives
    pub fn well_known_install_dirs(&self) -> Vec<std::path::PathBuf> {
        let dirs: &[&str] = match self.os {
            HostOs::Linux => &["/usr/bin", "/usr/local/bin"],
            HostOs::Macos => &["/opt/homebrew/bin", "/usr/local/bin"],
            HostOs::Windows => &["C:\\Program Files\\qemu"],
        };
        dirs.iter().map(std::path::PathBuf::from).collect()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = match self.os {
            HostOs::Linux => "linux",
            HostOs::Macos => "macos",
            HostOs::Windows => "windows",
        };
        let arch = match self.arch {
            HostArch::X86_64 => "x86_64",
            HostArch::Aarch64 => "aarch64",
        };
        write!(f, "{os}/{arch}")
    }
}
