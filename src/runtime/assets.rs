//! Disk image and boot asset resolution
//!
//! Artifacts land in `<base>/images/<version>/` and are only ever written by
//! rename after checksum verification, so an existing file is trusted.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::archive;
use super::download::{file_name_from_url, Downloader};
use super::platform::Platform;
use super::{ProvisionError, RuntimeInfo};
use crate::config::{ArtifactSource, RuntimeConfig};

/// Per-session copy of the firmware variables store
pub const SESSION_VARS_FILE: &str = "efi-vars.fd";

/// Optional boot assets for direct kernel or firmware boot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootAssets {
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub firmware_code: Option<PathBuf>,
    pub firmware_vars_template: Option<PathBuf>,
}

/// Resolve one artifact: explicit local path, cached copy, or download
///
/// A `.gz` URL is decompressed once into the cache.
pub async fn ensure_artifact(
    artifact: &'static str,
    source: &ArtifactSource,
    cache_dir: &Path,
    default_name: &str,
    downloader: &Downloader,
) -> Result<PathBuf, ProvisionError> {
    if let Some(path) = &source.path {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(ProvisionError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "configured file missing"),
        ));
    }

    let url = source
        .url
        .as_deref()
        .ok_or_else(|| ProvisionError::NotConfigured {
            artifact,
            hint: format!("set runtime.{artifact}.url or runtime.{artifact}.path"),
        })?;
    let download_name = file_name_from_url(url).unwrap_or_else(|| default_name.to_string());
    let compressed = download_name.to_ascii_lowercase().ends_with(".gz");
    let final_name = if compressed {
        download_name[..download_name.len() - 3].to_string()
    } else {
        download_name.clone()
    };
    let target = cache_dir.join(&final_name);
    if target.is_file() {
        debug!(artifact, path = %target.display(), "artifact cached");
        return Ok(target);
    }

    if !compressed {
        return downloader
            .fetch(artifact, url, &target, source.sha256.as_deref())
            .await;
    }

    let packed = cache_dir.join(&download_name);
    downloader
        .fetch(artifact, url, &packed, source.sha256.as_deref())
        .await?;
    let mut staging = target.clone().into_os_string();
    staging.push(".part");
    let staging = PathBuf::from(staging);
    let (src, dst) = (packed.clone(), staging.clone());
    tokio::task::spawn_blocking(move || archive::gunzip(&src, &dst))
        .await
        .map_err(|e| ProvisionError::Extract {
            path: packed.clone(),
            message: e.to_string(),
        })??;
    tokio::fs::rename(&staging, &target)
        .await
        .map_err(|source| ProvisionError::io(&target, source))?;
    let _ = tokio::fs::remove_file(&packed).await;
    info!(artifact, path = %target.display(), "artifact decompressed");
    Ok(target)
}

fn images_dir(config: &RuntimeConfig) -> PathBuf {
    config.base_dir.join("images").join(&config.version)
}

/// The read-only base disk image
pub async fn resolve_disk_image(
    config: &RuntimeConfig,
    downloader: &Downloader,
) -> Result<PathBuf, ProvisionError> {
    ensure_artifact(
        "disk_image",
        &config.disk_image,
        &images_dir(config),
        "guest.qcow2",
        downloader,
    )
    .await
}

/// Kernel + initrd when the platform can direct-boot, else firmware
pub async fn resolve_boot_assets(
    config: &RuntimeConfig,
    platform: &Platform,
    downloader: &Downloader,
) -> Result<BootAssets, ProvisionError> {
    let dir = images_dir(config);
    let direct = platform.supports_direct_boot()
        && config.kernel.is_configured()
        && config.initrd.is_configured();
    if direct {
        let kernel = ensure_artifact("kernel", &config.kernel, &dir, "vmlinuz", downloader).await?;
        let initrd = ensure_artifact("initrd", &config.initrd, &dir, "initrd.img", downloader).await?;
        return Ok(BootAssets {
            kernel: Some(kernel),
            initrd: Some(initrd),
            ..BootAssets::default()
        });
    }

    if config.firmware_code.is_configured() && config.firmware_vars.is_configured() {
        let code = ensure_artifact(
            "firmware_code",
            &config.firmware_code,
            &dir,
            "efi-code.fd",
            downloader,
        )
        .await?;
        let vars = ensure_artifact(
            "firmware_vars",
            &config.firmware_vars,
            &dir,
            "efi-vars-template.fd",
            downloader,
        )
        .await?;
        return Ok(BootAssets {
            firmware_code: Some(code),
            firmware_vars_template: Some(vars),
            ..BootAssets::default()
        });
    }

    if platform.requires_firmware() {
        return Err(ProvisionError::NotConfigured {
            artifact: "firmware_code",
            hint: format!("{platform} needs runtime.firmware_code and runtime.firmware_vars"),
        });
    }
    // Legacy BIOS boot from the disk image.
    Ok(BootAssets::default())
}

/// Copy the firmware variables template into a session directory
///
/// The vars store is written by the guest firmware, so concurrent VMs each
/// need their own copy. Returns `None` for kernel or BIOS boot.
pub async fn prepare_session_firmware(
    runtime: &RuntimeInfo,
    session_dir: &Path,
) -> Result<Option<PathBuf>, ProvisionError> {
    let Some(template) = &runtime.firmware_vars_template else {
        return Ok(None);
    };
    if runtime.kernel.is_some() {
        return Ok(None);
    }
    tokio::fs::create_dir_all(session_dir)
        .await
        .map_err(|source| ProvisionError::io(session_dir, source))?;
    let dest = session_dir.join(SESSION_VARS_FILE);
    tokio::fs::copy(template, &dest)
        .await
        .map_err(|source| ProvisionError::io(&dest, source))?;
    Ok(Some(dest))
}
