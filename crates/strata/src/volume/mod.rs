//! Volume stores.
//!
//! A volume holds the materialized content of one layer stacked on its
//! parent. Volumes are created, filled and committed once, then only ever
//! read or destroyed. Until committed a volume is not visible through
//! [`VolumeStore::volume_path`].

mod directory;

use std::path::{Path, PathBuf};

use serde::Serialize;
use strata_common::StrataResult;

pub use directory::DirectoryVolumeStore;

/// A volume present in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    /// Volume key.
    pub key: String,
    /// Key of the parent volume, if any.
    pub parent: Option<String>,
    /// Path of the volume content.
    pub path: PathBuf,
}

/// Physical backend for layer volumes.
pub trait VolumeStore: Send + Sync {
    /// Path of the content of an existing, committed volume.
    ///
    /// # Errors
    ///
    /// Returns [`strata_common::StrataError::VolumeNotFound`] if no committed
    /// volume exists for `key`.
    fn volume_path(&self, key: &str) -> StrataResult<PathBuf>;

    /// Create volume `key` as a child of `parent`, returning its content path.
    ///
    /// The volume stays invisible until [`VolumeStore::commit_volume`]. An
    /// uncommitted leftover under the same key is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if a committed volume already exists or the parent
    /// is missing.
    fn create_volume(&self, parent: Option<&str>, key: &str) -> StrataResult<PathBuf>;

    /// Mark volume `key` complete, making it visible as a cache hit.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume does not exist or cannot be marked.
    fn commit_volume(&self, key: &str) -> StrataResult<()>;

    /// Destroy volume `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume does not exist or cannot be removed.
    fn destroy_volume(&self, key: &str) -> StrataResult<()>;

    /// All volumes currently present, committed or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn volumes(&self) -> StrataResult<Vec<VolumeInfo>>;

    /// Write a private, writable copy of volume `key` to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume does not exist or the copy fails.
    fn snapshot_into(&self, key: &str, dest: &Path) -> StrataResult<()>;
}
