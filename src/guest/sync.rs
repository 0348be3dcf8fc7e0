//! Working-directory change detection (socket mode)
//!
//! Without a shared mount the host only sees guest files we send it. Each
//! scan walks the work dir and compares (mtime, size) against the previous
//! snapshot; changed regular files are returned for sending.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use crate::protocol::MAX_SYNC_FILE_SIZE;

/// A file that should be sent to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCandidate {
    /// `/`-separated path relative to the work dir
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
}

type Stamp = (Option<SystemTime>, u64);

pub struct SyncScanner {
    root: PathBuf,
    snapshot: HashMap<String, Stamp>,
}

impl SyncScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshot: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files changed since the last scan, or every file when `force` is set
    ///
    /// Symlinks are never followed or sent. Files over the size limit are
    /// skipped with a warning once per change.
    pub fn scan(&mut self, force: bool) -> Vec<SyncCandidate> {
        let mut changed = Vec::new();
        let mut seen = HashMap::with_capacity(self.snapshot.len());

        for entry in walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_key(&self.root, entry.path()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            let stamp = (meta.modified().ok(), meta.len());

            let is_new = self.snapshot.get(&relative) != Some(&stamp);
            if is_new || force {
                if meta.len() > MAX_SYNC_FILE_SIZE {
                    if is_new {
                        warn!(path = %relative, size = meta.len(), "file exceeds sync limit, skipping");
                    }
                } else {
                    changed.push(SyncCandidate {
                        relative: relative.clone(),
                        path: entry.path().to_path_buf(),
                        size: meta.len(),
                    });
                }
            }
            seen.insert(relative, stamp);
        }

        self.snapshot = seen;
        changed
    }

    /// Record a file written by the host so it is not echoed back
    pub fn observe(&mut self, path: &Path) {
        let Some(relative) = relative_key(&self.root, path) else {
            return;
        };
        if let Ok(meta) = std::fs::symlink_metadata(path) {
            self.snapshot
                .insert(relative, (meta.modified().ok(), meta.len()));
        }
    }

    /// Forget a file whose send failed so the next scan retries it
    pub fn forget(&mut self, relative: &str) {
        self.snapshot.remove(relative);
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}
