//! Archive extraction for downloaded hypervisor builds
//!
//! Blocking code; callers run it on `spawn_blocking`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use walkdir::WalkDir;

use super::ProvisionError;

/// Format of a downloaded file, decided by its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
    /// A single gzip-wrapped file
    Gzip,
    /// An `.exe`/`.msi` that must be run with elevation
    Installer,
    /// Not an archive; used as-is
    Raw,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if lower.ends_with(".tar") {
            ArchiveKind::Tar
        } else if lower.ends_with(".zip") {
            ArchiveKind::Zip
        } else if lower.ends_with(".gz") {
            ArchiveKind::Gzip
        } else if lower.ends_with(".exe") || lower.ends_with(".msi") {
            ArchiveKind::Installer
        } else {
            ArchiveKind::Raw
        }
    }
}

fn extract_err(path: &Path, message: impl ToString) -> ProvisionError {
    ProvisionError::Extract {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Unpack `archive` into `dest_dir`
///
/// # Arguments
/// * `single_name` - File name to give the output of `Gzip` and `Raw` inputs
///
/// Installers are not handled here.
pub fn extract(
    archive: &Path,
    kind: ArchiveKind,
    dest_dir: &Path,
    single_name: &str,
) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(dest_dir).map_err(|source| ProvisionError::io(dest_dir, source))?;
    let file = File::open(archive).map_err(|source| ProvisionError::io(archive, source))?;

    match kind {
        ArchiveKind::Tar => tar::Archive::new(file)
            .unpack(dest_dir)
            .map_err(|e| extract_err(archive, e)),
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file))
            .unpack(dest_dir)
            .map_err(|e| extract_err(archive, e)),
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| extract_err(archive, e))?;
            zip.extract(dest_dir).map_err(|e| extract_err(archive, e))
        }
        ArchiveKind::Gzip => {
            let out_path = dest_dir.join(single_name);
            let mut out =
                File::create(&out_path).map_err(|source| ProvisionError::io(&out_path, source))?;
            io::copy(&mut GzDecoder::new(file), &mut out).map_err(|e| extract_err(archive, e))?;
            make_executable(&out_path)
        }
        ArchiveKind::Raw => {
            let out_path = dest_dir.join(single_name);
            drop(file);
            std::fs::copy(archive, &out_path)
                .map_err(|source| ProvisionError::io(&out_path, source))?;
            make_executable(&out_path)
        }
        ArchiveKind::Installer => Err(extract_err(archive, "installers must be run, not extracted")),
    }
}

/// Decompress a single `.gz` file to `dest`
pub fn gunzip(src: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let file = File::open(src).map_err(|source| ProvisionError::io(src, source))?;
    let mut out = File::create(dest).map_err(|source| ProvisionError::io(dest, source))?;
    io::copy(&mut GzDecoder::new(file), &mut out).map_err(|e| extract_err(src, e))?;
    Ok(())
}

/// Find `name` anywhere under `dir` (archives often nest a versioned folder)
pub fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(4)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
        .map(|entry| entry.into_path())
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|source| ProvisionError::io(path, source))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms).map_err(|source| ProvisionError::io(path, source))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}
