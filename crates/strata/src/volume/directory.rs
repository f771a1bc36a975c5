//! Plain directory volumes.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use strata_common::{StorePaths, StrataError, StrataResult};

use super::{VolumeInfo, VolumeStore};
use crate::filesystem::{copy_tree, remove_tree};

const ROOTFS_DIR: &str = "rootfs";
const PARENT_FILE: &str = "parent";
const COMMITTED_FILE: &str = "committed";

/// Volume store keeping each volume as a directory.
///
/// A child volume starts as a full copy of its parent's content, assembled
/// in the store's scratch directory and renamed into place. The layer is
/// then unpacked in place, and only a volume carrying the commit marker
/// counts as present. A volume left without one by a crash is treated as
/// absent and replaced by the next build.
#[derive(Debug, Clone)]
pub struct DirectoryVolumeStore {
    volumes_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl DirectoryVolumeStore {
    /// Create a store over the volume directory of `paths`.
    #[must_use]
    pub fn new(paths: &StorePaths) -> Self {
        Self {
            volumes_dir: paths.volumes(),
            tmp_dir: paths.tmp(),
        }
    }

    fn volume_dir(&self, key: &str) -> PathBuf {
        self.volumes_dir.join(key)
    }

    fn is_committed(dir: &Path) -> bool {
        dir.join(COMMITTED_FILE).is_file() && dir.join(ROOTFS_DIR).is_dir()
    }

    fn validate_key(key: &str) -> StrataResult<()> {
        if key.is_empty() || key.starts_with('.') || key.contains('/') {
            return Err(StrataError::VolumeCreation {
                key: key.to_string(),
                message: "invalid volume key".to_string(),
            });
        }
        Ok(())
    }

    fn read_parent(dir: &Path) -> io::Result<Option<String>> {
        match fs::read_to_string(dir.join(PARENT_FILE)) {
            Ok(content) => {
                let parent = content.trim();
                Ok((!parent.is_empty()).then(|| parent.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Assemble the volume in a scratch directory and move it into place.
    fn assemble(&self, parent: Option<(&str, &Path)>, key: &str) -> StrataResult<PathBuf> {
        fs::create_dir_all(&self.tmp_dir)?;
        fs::create_dir_all(&self.volumes_dir)?;

        let staging = tempfile::Builder::new()
            .prefix(&format!("volume-{key}-"))
            .tempdir_in(&self.tmp_dir)?;
        let rootfs = staging.path().join(ROOTFS_DIR);

        match parent {
            Some((parent_key, parent_rootfs)) => {
                copy_tree(parent_rootfs, &rootfs)?;
                fs::write(staging.path().join(PARENT_FILE), parent_key)?;
            }
            None => fs::create_dir(&rootfs)?,
        }

        let final_dir = self.volume_dir(key);
        fs::rename(staging.path(), &final_dir)?;

        Ok(final_dir.join(ROOTFS_DIR))
    }
}

impl VolumeStore for DirectoryVolumeStore {
    fn volume_path(&self, key: &str) -> StrataResult<PathBuf> {
        let dir = self.volume_dir(key);
        if key.is_empty() || !Self::is_committed(&dir) {
            return Err(StrataError::VolumeNotFound {
                key: key.to_string(),
            });
        }
        Ok(dir.join(ROOTFS_DIR))
    }

    fn create_volume(&self, parent: Option<&str>, key: &str) -> StrataResult<PathBuf> {
        Self::validate_key(key)?;

        let creation = |message: String| StrataError::VolumeCreation {
            key: key.to_string(),
            message,
        };

        let dir = self.volume_dir(key);
        if Self::is_committed(&dir) {
            return Err(creation("volume already exists".to_string()));
        }
        if dir.exists() {
            tracing::debug!(key, "Replacing uncommitted volume");
            remove_tree(&dir).map_err(|e| creation(e.to_string()))?;
        }

        let parent_rootfs = parent
            .map(|p| {
                self.volume_path(p)
                    .map_err(|_| creation(format!("parent volume {p} does not exist")))
            })
            .transpose()?;

        let path = self
            .assemble(parent.zip(parent_rootfs.as_deref()), key)
            .map_err(|e| creation(e.to_string()))?;

        tracing::debug!(key, parent = ?parent, path = %path.display(), "Volume created");
        Ok(path)
    }

    fn commit_volume(&self, key: &str) -> StrataResult<()> {
        let dir = self.volume_dir(key);
        if key.is_empty() || !dir.join(ROOTFS_DIR).is_dir() {
            return Err(StrataError::VolumeNotFound {
                key: key.to_string(),
            });
        }

        File::create(dir.join(COMMITTED_FILE))
            .and_then(|marker| marker.sync_all())
            .map_err(|e| StrataError::VolumeCreation {
                key: key.to_string(),
                message: format!("failed to commit volume: {e}"),
            })?;

        tracing::debug!(key, "Volume committed");
        Ok(())
    }

    fn destroy_volume(&self, key: &str) -> StrataResult<()> {
        let dir = self.volume_dir(key);
        if key.is_empty() || !dir.is_dir() {
            return Err(StrataError::VolumeNotFound {
                key: key.to_string(),
            });
        }

        remove_tree(&dir).map_err(|e| StrataError::VolumeDestroy {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        tracing::debug!(key, "Volume destroyed");
        Ok(())
    }

    fn volumes(&self) -> StrataResult<Vec<VolumeInfo>> {
        let mut volumes = Vec::new();

        let entries = match fs::read_dir(&self.volumes_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(volumes),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let rootfs = entry.path().join(ROOTFS_DIR);
            if !rootfs.is_dir() {
                continue;
            }
            if let Some(key) = entry.file_name().to_str() {
                volumes.push(VolumeInfo {
                    key: key.to_string(),
                    parent: Self::read_parent(&entry.path())?,
                    path: rootfs,
                });
            }
        }

        volumes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(volumes)
    }

    fn snapshot_into(&self, key: &str, dest: &Path) -> StrataResult<()> {
        let rootfs = self.volume_path(key)?;
        copy_tree(&rootfs, dest)
    }
}
