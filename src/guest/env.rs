//! Subprocess environment for engine runs
//!
//! The host forwards its own environment map, which may carry macOS or
//! Windows values for HOME, PATH and friends. Those keys are replaced with
//! guest values; everything else passes through.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Keys always set from the guest's point of view
pub const NORMALIZED_KEYS: &[&str] = &[
    "HOME", "SHELL", "PATH", "TMPDIR", "TMP", "TEMP", "USER", "LOGNAME", "LANG",
];

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// The user the daemon runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    pub user: String,
    pub home: PathBuf,
}

impl GuestIdentity {
    #[cfg(unix)]
    pub fn current() -> Self {
        use nix::unistd::{getuid, User};
        match User::from_uid(getuid()) {
            Ok(Some(user)) => Self {
                user: user.name,
                home: user.dir,
            },
            _ => Self::fallback(),
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self::fallback()
    }

    fn fallback() -> Self {
        Self {
            user: "root".into(),
            home: PathBuf::from("/root"),
        }
    }
}

/// Merge the request's env with normalized guest defaults
pub fn normalized_env(
    request_env: &BTreeMap<String, String>,
    identity: &GuestIdentity,
    tmp_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = request_env
        .iter()
        .filter(|(k, _)| !NORMALIZED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let home = identity.home.display().to_string();
    let tmp = tmp_dir.display().to_string();
    env.insert("HOME".into(), home.clone());
    env.insert("SHELL".into(), "/bin/bash".into());
    env.insert("PATH".into(), format!("{home}/.local/bin:{DEFAULT_PATH}"));
    env.insert("TMPDIR".into(), tmp.clone());
    env.insert("TMP".into(), tmp.clone());
    env.insert("TEMP".into(), tmp);
    env.insert("USER".into(), identity.user.clone());
    env.insert("LOGNAME".into(), identity.user.clone());
    env.insert("LANG".into(), "C.UTF-8".into());
    env
}
