//! Whole-tree copy and removal.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt, lchown, symlink};
use std::path::Path;

use strata_common::{StrataError, StrataResult};
use walkdir::WalkDir;

/// Copy the tree at `src` to `dest`, which must not exist yet.
///
/// Regular files, directories and symlinks are copied with their mode.
/// Ownership is kept when running as root. Hard links are copied as
/// separate files and special files are skipped.
///
/// # Errors
///
/// Returns an error if the source cannot be walked or any entry fails to
/// copy.
pub fn copy_tree(src: &Path, dest: &Path) -> StrataResult<()> {
    let as_root = rustix::process::geteuid().is_root();
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| StrataError::Internal {
            message: format!("Failed to walk {}: {e}", src.display()),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StrataError::Internal {
                message: e.to_string(),
            })?;
        let target = dest.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            dirs.push((target, meta));
            continue;
        }

        if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
            continue;
        }

        if as_root {
            lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
            if !file_type.is_symlink() && meta.mode() & 0o6000 != 0 {
                fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode()))?;
            }
        }
    }

    // Directory modes last so read-only directories can still be filled.
    for (dir, meta) in dirs.into_iter().rev() {
        if as_root {
            lchown(&dir, Some(meta.uid()), Some(meta.gid()))?;
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(meta.mode()))?;
    }

    Ok(())
}

/// Remove the tree at `path`, making directories writable where needed.
///
/// # Errors
///
/// Returns an error if the tree cannot be removed.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_writable(path)?;
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

fn make_writable(path: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_dir() {
            let mut perms = entry.metadata().map_err(io::Error::other)?.permissions();
            perms.set_mode(perms.mode() | 0o700);
            fs::set_permissions(entry.path(), perms)?;
        }
    }
    Ok(())
}
