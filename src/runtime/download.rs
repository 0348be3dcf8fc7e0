//! Checksum-verified artifact downloads
//!
//! Bodies are streamed into `<dest>.part` while hashing; the part file is
//! renamed into place only after the SHA-256 matches. A stale part file from
//! an earlier attempt is discarded, never resumed.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ProvisionError;
use crate::metrics::DOWNLOAD_BYTES;

/// Incremental download progress for UI consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub artifact: &'static str,
    pub received: u64,
    pub total: Option<u64>,
}

/// HTTP client plus the progress side channel
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    progress: broadcast::Sender<ProgressEvent>,
}

impl Downloader {
    pub fn new() -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            client: reqwest::Client::new(),
            progress,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    fn report(&self, artifact: &'static str, received: u64, total: Option<u64>) {
        // No subscribers is fine.
        let _ = self.progress.send(ProgressEvent {
            artifact,
            received,
            total,
        });
    }

    /// Fetch `url` into `dest`, verifying `sha256` when given
    ///
    /// # Arguments
    /// * `artifact` - Label used for progress events and metrics
    /// * `url` - `http(s)://` or `file://` source
    /// * `dest` - Final location; only ever written by rename
    /// * `sha256` - Expected hex digest
    pub async fn fetch(
        &self,
        artifact: &'static str,
        url: &str,
        dest: &Path,
        sha256: Option<&str>,
    ) -> Result<PathBuf, ProvisionError> {
        let part = part_path(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ProvisionError::io(parent, source))?;
        }
        match tokio::fs::remove_file(&part).await {
            Ok(()) => debug!(path = %part.display(), "discarded stale partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ProvisionError::io(&part, source)),
        }

        info!(artifact, url, "downloading");
        let digest = match local_source(url) {
            Some(src) => self.copy_local(artifact, &src, &part).await,
            None => self.fetch_http(artifact, url, &part).await,
        };
        let digest = match digest {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if let Some(expected) = sha256 {
            if !expected.eq_ignore_ascii_case(&digest) {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(ProvisionError::Checksum {
                    artifact,
                    expected: expected.to_ascii_lowercase(),
                    actual: digest,
                });
            }
        }

        tokio::fs::rename(&part, dest)
            .await
            .map_err(|source| ProvisionError::io(dest, source))?;
        info!(artifact, path = %dest.display(), "download complete");
        Ok(dest.to_path_buf())
    }

    async fn fetch_http(
        &self,
        artifact: &'static str,
        url: &str,
        part: &Path,
    ) -> Result<String, ProvisionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ProvisionError::Download {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|source| ProvisionError::io(part, source))?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        let mut body = response.bytes_stream();

        self.report(artifact, 0, total);
        while let Some(chunk) = body.next().await {
            let bytes = chunk.map_err(|source| ProvisionError::Download {
                url: url.to_string(),
                source,
            })?;
            hasher.update(&bytes);
            file.write_all(&bytes)
                .await
                .map_err(|source| ProvisionError::io(part, source))?;
            received += bytes.len() as u64;
            DOWNLOAD_BYTES
                .with_label_values(&[artifact])
                .inc_by(bytes.len() as u64);
            self.report(artifact, received, total);
        }
        file.flush()
            .await
            .map_err(|source| ProvisionError::io(part, source))?;

        Ok(hex::encode(hasher.finalize()))
    }

    async fn copy_local(
        &self,
        artifact: &'static str,
        src: &Path,
        part: &Path,
    ) -> Result<String, ProvisionError> {
        let data = tokio::fs::read(src)
            .await
            .map_err(|source| ProvisionError::io(src, source))?;
        let total = Some(data.len() as u64);
        self.report(artifact, 0, total);
        tokio::fs::write(part, &data)
            .await
            .map_err(|source| ProvisionError::io(part, source))?;
        DOWNLOAD_BYTES
            .with_label_values(&[artifact])
            .inc_by(data.len() as u64);
        self.report(artifact, data.len() as u64, total);
        Ok(sha256_hex(&data))
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn local_source(url: &str) -> Option<PathBuf> {
    if !url.starts_with("file://") {
        return None;
    }
    url::Url::parse(url).ok()?.to_file_path().ok()
}

/// Last path segment of a URL, used as the cached file name
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}
