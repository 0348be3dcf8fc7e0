//! Path containment guard for every peer-supplied write
//!
//! A relative path received over the wire is resolved against a declared
//! root. The write is allowed only if the lexical result stays under the
//! root and, once symlinks of the existing part are resolved, the real
//! location is still under the root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A peer-supplied path escaped its declared root
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("path `{requested}` escapes `{}`", root.display())]
pub struct PathTraversal {
    pub requested: String,
    pub root: PathBuf,
}

/// Collapse `.` and `..` without touching the filesystem
///
/// Leading `..` components that would climb above the start are kept so
/// callers can detect the escape.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve symlinks for the longest existing prefix of `path`
///
/// The non-existent tail is appended unchanged, so paths to files that
/// are about to be created still resolve to their real parent.
pub fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            let mut resolved = real;
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolve `relative` under `root`, rejecting anything that escapes it
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, PathTraversal> {
    let traversal = || PathTraversal {
        requested: relative.to_string(),
        root: root.to_path_buf(),
    };

    // Peers on another OS may send backslash separators
    let cleaned = relative.replace('\\', "/");
    let candidate = Path::new(&cleaned);
    if cleaned.is_empty()
        || candidate.has_root()
        || candidate
            .components()
            .any(|c| matches!(c, Component::Prefix(_)))
    {
        return Err(traversal());
    }

    let joined = normalize_lexically(&root.join(candidate));
    let lexical_root = normalize_lexically(root);
    if !joined.starts_with(&lexical_root) || joined == lexical_root {
        return Err(traversal());
    }

    let real_root = canonicalize_existing_prefix(&lexical_root);
    let real_target = canonicalize_existing_prefix(&joined);
    if !real_target.starts_with(&real_root) {
        return Err(traversal());
    }

    Ok(joined)
}
