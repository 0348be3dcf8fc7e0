//! Hypervisor binary resolution
//!
//! ```text
//!   <base>/hypervisor/<version>/.complete ──exists──► extracted copy
//!                 │ missing
//!   system install (PATH, well-known dirs) ──runs──► system copy
//!                 │ none usable
//!   download ──► verify ──► extract | run installer ──► write marker
//! ```
//!
//! Every resolved binary is checked for shared-directory support. A build
//! without it selects the socket transport; that is not a failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::archive::{self, ArchiveKind};
use super::download::{file_name_from_url, Downloader};
use super::platform::{HostOs, Platform};
use super::{ProvisionError, TransportKind};
use crate::config::RuntimeConfig;

const MARKER_FILE: &str = ".complete";
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Where the hypervisor binary came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorOrigin {
    Extracted,
    System,
    Installed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedHypervisor {
    pub binary: PathBuf,
    pub transport: TransportKind,
    pub origin: HypervisorOrigin,
}

pub async fn resolve(
    config: &RuntimeConfig,
    platform: &Platform,
    downloader: &Downloader,
) -> Result<ResolvedHypervisor, ProvisionError> {
    let versioned = config
        .base_dir
        .join("hypervisor")
        .join(&config.version);

    if let Some(cached) = read_marker(&versioned).await {
        debug!(binary = %cached.binary.display(), "using extracted hypervisor");
        return Ok(cached);
    }

    if let Some(path) = &config.hypervisor.path {
        let transport = usable_transport(config, platform, path).await?;
        return Ok(ResolvedHypervisor {
            binary: path.clone(),
            transport,
            origin: HypervisorOrigin::System,
        });
    }

    if config.allow_system_hypervisor {
        if let Some(found) = find_system(platform) {
            match usable_transport(config, platform, &found).await {
                Ok(transport) => {
                    info!(binary = %found.display(), ?transport, "using system hypervisor");
                    return Ok(ResolvedHypervisor {
                        binary: found,
                        transport,
                        origin: HypervisorOrigin::System,
                    });
                }
                Err(e) => warn!(error = %e, "system hypervisor unusable, falling back to download"),
            }
        }
    }

    let url = config
        .hypervisor
        .url
        .as_deref()
        .ok_or_else(|| ProvisionError::NotConfigured {
            artifact: "hypervisor",
            hint: "set runtime.hypervisor.url or install QEMU".to_string(),
        })?;
    let name = file_name_from_url(url).unwrap_or_else(|| platform.hypervisor_binary_name());
    let archive_path = config.base_dir.join("downloads").join(&name);
    downloader
        .fetch(
            "hypervisor",
            url,
            &archive_path,
            config.hypervisor.sha256.as_deref(),
        )
        .await?;

    let kind = ArchiveKind::from_name(&name);
    let (binary, origin) = if kind == ArchiveKind::Installer {
        (run_installer(platform, &archive_path).await?, HypervisorOrigin::Installed)
    } else {
        (
            extract_versioned(platform, &archive_path, kind, &versioned).await?,
            HypervisorOrigin::Extracted,
        )
    };

    let transport = usable_transport(config, platform, &binary).await?;
    let resolved = ResolvedHypervisor {
        binary,
        transport,
        origin,
    };
    write_marker(&versioned, &resolved).await?;
    let _ = tokio::fs::remove_file(&archive_path).await;
    Ok(resolved)
}

async fn read_marker(versioned: &Path) -> Option<ResolvedHypervisor> {
    let text = tokio::fs::read_to_string(versioned.join(MARKER_FILE))
        .await
        .ok()?;
    let resolved: ResolvedHypervisor = serde_json::from_str(&text).ok()?;
    resolved.binary.exists().then_some(resolved)
}

async fn write_marker(versioned: &Path, resolved: &ResolvedHypervisor) -> Result<(), ProvisionError> {
    tokio::fs::create_dir_all(versioned)
        .await
        .map_err(|source| ProvisionError::io(versioned, source))?;
    let marker = versioned.join(MARKER_FILE);
    let body = serde_json::to_vec_pretty(resolved).map_err(|e| ProvisionError::Extract {
        path: marker.clone(),
        message: e.to_string(),
    })?;
    tokio::fs::write(&marker, body)
        .await
        .map_err(|source| ProvisionError::io(&marker, source))
}

async fn extract_versioned(
    platform: &Platform,
    archive_path: &Path,
    kind: ArchiveKind,
    versioned: &Path,
) -> Result<PathBuf, ProvisionError> {
    // A previous attempt may have left a half-extracted tree.
    if versioned.exists() {
        tokio::fs::remove_dir_all(versioned)
            .await
            .map_err(|source| ProvisionError::io(versioned, source))?;
    }
    let binary_name = platform.hypervisor_binary_name();
    let archive_path = archive_path.to_path_buf();
    let dest = versioned.to_path_buf();
    let name = binary_name.clone();
    tokio::task::spawn_blocking(move || archive::extract(&archive_path, kind, &dest, &name))
        .await
        .map_err(|e| ProvisionError::Extract {
            path: versioned.to_path_buf(),
            message: e.to_string(),
        })??;

    let binary = archive::find_file(versioned, &binary_name).ok_or_else(|| ProvisionError::Extract {
        path: versioned.to_path_buf(),
        message: format!("archive does not contain {binary_name}"),
    })?;
    archive::make_executable(&binary)?;
    info!(binary = %binary.display(), "hypervisor extracted");
    Ok(binary)
}

/// Run a Windows installer with elevation and locate what it installed
async fn run_installer(platform: &Platform, installer: &Path) -> Result<PathBuf, ProvisionError> {
    if platform.os != HostOs::Windows {
        return Err(ProvisionError::Installer(format!(
            "{} is an installer; only supported on windows",
            installer.display()
        )));
    }
    info!(installer = %installer.display(), "running hypervisor installer (elevation required)");
    let script = format!(
        "Start-Process -FilePath '{}' -Verb RunAs -Wait",
        installer.display().to_string().replace('\'', "''")
    );
    let status = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", &script])
        .status()
        .await
        .map_err(|e| ProvisionError::Installer(e.to_string()))?;
    if !status.success() {
        return Err(ProvisionError::Installer(format!(
            "installer exited with {status} (elevation declined?)"
        )));
    }

    let binary_name = platform.hypervisor_binary_name();
    platform
        .well_known_install_dirs()
        .iter()
        .find_map(|dir| archive::find_file(dir, &binary_name))
        .ok_or_else(|| {
            ProvisionError::Installer(format!("{binary_name} not found after installation"))
        })
}

/// Look for an OS-installed hypervisor on PATH and in well-known dirs
fn find_system(platform: &Platform) -> Option<PathBuf> {
    let name = platform.hypervisor_binary_name();
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    dirs.extend(platform.well_known_install_dirs());
    dirs.into_iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

/// Sanity-check a binary and decide which transport it can serve
async fn usable_transport(
    config: &RuntimeConfig,
    platform: &Platform,
    binary: &Path,
) -> Result<TransportKind, ProvisionError> {
    let version = run_query(binary, &["--version"]).await?;
    debug!(binary = %binary.display(), version = %version.lines().next().unwrap_or(""), "hypervisor runs");

    if !platform.supports_shared_dirs() || !config.require_shared_dirs {
        return Ok(TransportKind::Socket);
    }
    match run_query(binary, &["-device", "help"]).await {
        Ok(devices) if has_virtfs(&devices) => Ok(TransportKind::SharedFs),
        Ok(_) => {
            info!("hypervisor lacks shared-directory support, using socket transport");
            Ok(TransportKind::Socket)
        }
        Err(e) => {
            warn!(error = %e, "device probe failed, using socket transport");
            Ok(TransportKind::Socket)
        }
    }
}

pub fn has_virtfs(device_help: &str) -> bool {
    device_help.contains("virtio-9p")
}

async fn run_query(binary: &Path, args: &[&str]) -> Result<String, ProvisionError> {
    let unusable = |message: String| ProvisionError::HypervisorUnusable {
        path: binary.to_path_buf(),
        message,
    };
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(binary).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| unusable(format!("`{}` timed out", args.join(" "))))?
    .map_err(|e| unusable(e.to_string()))?;
    if !output.status.success() {
        return Err(unusable(format!(
            "`{}` exited with {}",
            args.join(" "),
            output.status
        )));
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtfs_detection() {
        let help = "Storage devices:\nname \"virtio-9p-pci\", bus PCI, alias \"virtio-9p\"\n";
        assert!(has_virtfs(help));
        assert!(!has_virtfs("name \"virtio-blk-pci\", bus PCI\n"));
    }

    #[tokio::test]
    async fn test_marker_round_trip_requires_binary() {
        let dir = tempfile::tempdir().unwrap();
        let versioned = dir.path().join("hypervisor").join("1");
        let binary = dir.path().join("qemu-system-x86_64");
        let resolved = ResolvedHypervisor {
            binary: binary.clone(),
            transport: TransportKind::Socket,
            origin: HypervisorOrigin::Extracted,
        };
        write_marker(&versioned, &resolved).await.unwrap();
        assert!(read_marker(&versioned).await.is_none());

        std::fs::write(&binary, b"").unwrap();
        assert_eq!(read_marker(&versioned).await, Some(resolved));
    }

    #[tokio::test]
    async fn test_installer_rejected_off_windows() {
        let platform = Platform::from_parts("linux", "x86_64").unwrap();
        let err = run_installer(&platform, Path::new("/tmp/qemu.exe"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Installer(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capability_script_without_virtfs_selects_socket() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("qemu-system-x86_64");
        std::fs::write(&binary, "#!/bin/sh\necho 'QEMU emulator version 9.0.2'\n").unwrap();
        archive::make_executable(&binary).unwrap();

        let platform = Platform::from_parts("linux", "x86_64").unwrap();
        let config = RuntimeConfig::default();
        let transport = usable_transport(&config, &platform, &binary).await.unwrap();
        assert_eq!(transport, TransportKind::Socket);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capability_script_with_virtfs_selects_shared_fs() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("qemu-system-x86_64");
        std::fs::write(
            &binary,
            "#!/bin/sh\nif [ \"$1\" = \"-device\" ]; then echo 'name \"virtio-9p-pci\"'; else echo QEMU; fi\n",
        )
        .unwrap();
        archive::make_executable(&binary).unwrap();

        let platform = Platform::from_parts("linux", "x86_64").unwrap();
        let transport = usable_transport(&RuntimeConfig::default(), &platform, &binary)
            .await
            .unwrap();
        assert_eq!(transport, TransportKind::SharedFs);
    }
}
