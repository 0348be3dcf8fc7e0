//! Host configuration
//!
//! Loaded from an optional TOML file and then overridden by `SANDVISOR_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file) is a valid configuration.
//!
//! ```toml
//! [runtime]
//! base_dir = "/var/lib/sandvisor"
//! version = "9.0.2"
//!
//! [runtime.hypervisor]
//! url = "https://example.org/qemu-9.0.2-linux-x86_64.tar.gz"
//! sha256 = "…"
//!
//! [vm]
//! memory_mib = 4096
//! cpus = 2
//! accel = "kvm"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::TransportKind;
use crate::vm::Accel;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SANDVISOR_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Where one downloadable artifact comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSource {
    /// Use this file as-is instead of downloading
    pub path: Option<PathBuf>,
    /// Download URL (`https://` or `file://`)
    pub url: Option<String>,
    /// Expected SHA-256 of the downloaded file, hex encoded
    pub sha256: Option<String>,
}

impl ArtifactSource {
    pub fn is_configured(&self) -> bool {
        self.path.is_some() || self.url.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root for extracted hypervisors, images and session directories
    pub base_dir: PathBuf,
    /// Version label used for the on-disk cache layout
    pub version: String,
    /// Accept a hypervisor already installed on the host
    pub allow_system_hypervisor: bool,
    /// Probe for shared-directory support; without it the socket transport is used
    pub require_shared_dirs: bool,
    pub hypervisor: ArtifactSource,
    pub disk_image: ArtifactSource,
    pub kernel: ArtifactSource,
    pub initrd: ArtifactSource,
    pub firmware_code: ArtifactSource,
    pub firmware_vars: ArtifactSource,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            version: "1".to_string(),
            allow_system_hypervisor: true,
            require_shared_dirs: true,
            hypervisor: ArtifactSource::default(),
            disk_image: ArtifactSource::default(),
            kernel: ArtifactSource::default(),
            initrd: ArtifactSource::default(),
            firmware_code: ArtifactSource::default(),
            firmware_vars: ArtifactSource::default(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".sandvisor"))
        .unwrap_or_else(|| std::env::temp_dir().join("sandvisor"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub memory_mib: u32,
    pub cpus: u32,
    /// Force an acceleration backend instead of the per-OS default
    pub accel: Option<Accel>,
    /// Force a transport instead of the probed one
    pub transport: Option<TransportKind>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_mib: 4096,
            cpus: 2,
            accel: None,
            transport: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub permission_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// How long to wait for the first heartbeat after launch
    pub ready_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            permission_timeout_secs: crate::protocol::PERMISSION_TIMEOUT.as_secs(),
            poll_interval_ms: 200,
            heartbeat_interval_secs: crate::protocol::HEARTBEAT_INTERVAL.as_secs(),
            ready_timeout_secs: 120,
        }
    }
}

impl BridgeConfig {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint; console logging only when unset
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandvisorConfig {
    pub runtime: RuntimeConfig,
    pub vm: VmConfig,
    pub bridge: BridgeConfig,
    pub telemetry: TelemetryConfig,
}

impl SandvisorConfig {
    /// Load from `path` (or `$SANDVISOR_CONFIG`), then apply env overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `SANDVISOR_*` overrides read through `lookup`
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("SANDVISOR_BASE_DIR") {
            self.runtime.base_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("SANDVISOR_MEMORY_MIB") {
            self.vm.memory_mib = parse_env("SANDVISOR_MEMORY_MIB", v)?;
        }
        if let Some(v) = lookup("SANDVISOR_CPUS") {
            self.vm.cpus = parse_env("SANDVISOR_CPUS", v)?;
        }
        if let Some(v) = lookup("SANDVISOR_ACCEL") {
            self.vm.accel = Some(parse_env("SANDVISOR_ACCEL", v)?);
        }
        if let Some(v) = lookup("SANDVISOR_TRANSPORT") {
            self.vm.transport = Some(parse_env("SANDVISOR_TRANSPORT", v)?);
        }
        if let Some(v) = lookup("SANDVISOR_PERMISSION_TIMEOUT_SECS") {
            self.bridge.permission_timeout_secs =
                parse_env("SANDVISOR_PERMISSION_TIMEOUT_SECS", v)?;
        }
        if let Some(endpoint) = lookup("SANDVISOR_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }
        Ok(())
    }

    /// Directory holding one subdirectory per session
    pub fn sessions_dir(&self) -> PathBuf {
        self.runtime.base_dir.join("sessions")
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_is_default() {
        let config = SandvisorConfig::from_toml("").unwrap();
        assert_eq!(config, SandvisorConfig::default());
        assert_eq!(config.vm.memory_mib, 4096);
        assert_eq!(config.vm.cpus, 2);
        assert_eq!(config.bridge.permission_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml() {
        let config = SandvisorConfig::from_toml(
            r#"
            [runtime]
            version = "9.0.2"

            [runtime.disk_image]
            url = "https://example.org/guest.qcow2"
            sha256 = "abc"

            [vm]
            cpus = 4
            accel = "tcg"
            transport = "socket"
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.version, "9.0.2");
        assert!(config.runtime.disk_image.is_configured());
        assert!(!config.runtime.kernel.is_configured());
        assert_eq!(config.vm.cpus, 4);
        assert_eq!(config.vm.memory_mib, 4096);
        assert_eq!(config.vm.accel, Some(Accel::Tcg));
        assert_eq!(config.vm.transport, Some(TransportKind::Socket));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SANDVISOR_BASE_DIR", "/srv/sv"),
            ("SANDVISOR_MEMORY_MIB", "2048"),
            ("SANDVISOR_ACCEL", "kvm"),
            ("SANDVISOR_TRANSPORT", "shared_fs"),
        ]
        .into_iter()
        .collect();
        let mut config = SandvisorConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runtime.base_dir, PathBuf::from("/srv/sv"));
        assert_eq!(config.vm.memory_mib, 2048);
        assert_eq!(config.vm.accel, Some(Accel::Kvm));
        assert_eq!(config.vm.transport, Some(TransportKind::SharedFs));
        assert_eq!(config.sessions_dir(), PathBuf::from("/srv/sv/sessions"));
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = SandvisorConfig::default();
        let err = config
            .apply_overrides(|k| (k == "SANDVISOR_CPUS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "SANDVISOR_CPUS", .. }));
    }
}
