//! Runtime provisioning
//!
//! Makes sure a hypervisor, a base disk image and (optionally) boot assets
//! exist on disk before any session starts:
//! - `platform` - supported OS/arch matrix
//! - `download` - streamed, checksum-verified fetches with progress events
//! - `archive` - tar / tar.gz / zip / gzip extraction
//! - `hypervisor` - extracted, system or downloaded hypervisor + capability probe
//! - `assets` - disk image, kernel/initrd or firmware, per-session vars copy

pub mod archive;
pub mod assets;
pub mod download;
pub mod hypervisor;
pub mod platform;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tracing::info;

pub use assets::prepare_session_firmware;
pub use download::{Downloader, ProgressEvent};
pub use platform::{HostArch, HostOs, Platform};

use crate::config::RuntimeConfig;
use crate::metrics::PROVISION_DURATION;

/// Which control channel the guest will use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 9p shared directories polled by both sides
    SharedFs,
    /// virtio-serial port proxied to a host TCP listener
    Socket,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared_fs" | "file" | "9p" => Ok(TransportKind::SharedFs),
            "socket" | "serial" => Ok(TransportKind::Socket),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unsupported platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("{artifact} is not configured: {hint}")]
    NotConfigured { artifact: &'static str, hint: String },

    #[error("download of {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    Checksum {
        artifact: &'static str,
        expected: String,
        actual: String,
    },

    #[error("failed to extract {}: {message}", path.display())]
    Extract { path: PathBuf, message: String },

    #[error("hypervisor installer failed: {0}")]
    Installer(String),

    #[error("hypervisor {} is unusable: {message}", path.display())]
    HypervisorUnusable { path: PathBuf, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether re-running the whole provisioning flow can help
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProvisionError::UnsupportedPlatform { .. } | ProvisionError::NotConfigured { .. }
        )
    }
}

/// Everything a launch needs, resolved once
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub platform: Platform,
    pub hypervisor_binary: PathBuf,
    pub disk_image: PathBuf,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub firmware_code: Option<PathBuf>,
    pub firmware_vars_template: Option<PathBuf>,
    /// Transport the hypervisor build can serve
    pub transport: TransportKind,
    pub base_dir: PathBuf,
}

/// Resolves the runtime once and shares the result
///
/// Concurrent `ensure_ready()` callers wait on one in-flight attempt. A
/// failed attempt is not cached.
#[derive(Clone)]
pub struct Provisioner {
    config: Arc<RuntimeConfig>,
    downloader: Downloader,
    ready: Arc<OnceCell<RuntimeInfo>>,
}

impl Provisioner {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: Arc::new(config),
            downloader: Downloader::new(),
            ready: Arc::new(OnceCell::new()),
        }
    }

    /// Progress events for every download this provisioner performs
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.downloader.subscribe()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn ensure_ready(&self) -> Result<RuntimeInfo, ProvisionError> {
        self.ready
            .get_or_try_init(|| self.provision())
            .await
            .cloned()
    }

    async fn provision(&self) -> Result<RuntimeInfo, ProvisionError> {
        let platform = Platform::detect()?;
        let start = Instant::now();
        info!(%platform, base_dir = %self.config.base_dir.display(), "provisioning runtime");

        let hv = hypervisor::resolve(&self.config, &platform, &self.downloader).await?;
        let disk_image = assets::resolve_disk_image(&self.config, &self.downloader).await?;
        let boot = assets::resolve_boot_assets(&self.config, &platform, &self.downloader).await?;

        let elapsed = start.elapsed();
        PROVISION_DURATION.observe(elapsed.as_secs_f64());
        info!(
            binary = %hv.binary.display(),
            transport = ?hv.transport,
            elapsed_ms = elapsed.as_millis() as u64,
            "runtime ready"
        );

        Ok(RuntimeInfo {
            platform,
            hypervisor_binary: hv.binary,
            disk_image,
            kernel: boot.kernel,
            initrd: boot.initrd,
            firmware_code: boot.firmware_code,
            firmware_vars_template: boot.firmware_vars_template,
            transport: hv.transport,
            base_dir: self.config.base_dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactSource;

    #[test]
    fn test_transport_from_str() {
        assert_eq!("socket".parse::<TransportKind>(), Ok(TransportKind::Socket));
        assert_eq!("SHARED_FS".parse::<TransportKind>(), Ok(TransportKind::SharedFs));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[tokio::test]
    async fn test_failed_attempt_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            base_dir: dir.path().to_path_buf(),
            allow_system_hypervisor: false,
            hypervisor: ArtifactSource::default(),
            ..RuntimeConfig::default()
        };
        let provisioner = Provisioner::new(config);
        let first = provisioner.ensure_ready().await;
        assert!(first.is_err());
        // Still uninitialized, so a retry runs the flow again.
        assert!(provisioner.ready.get().is_none());
        assert!(provisioner.ensure_ready().await.is_err());
    }
}
