//! Bundle storage.
//!
//! A bundle is the writable root filesystem handed to one container,
//! created as a private copy of the topmost volume of its base image.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::{BundleId, ChainId, StorePaths, StrataError, StrataResult};
use strata_image::ImageConfig;

use crate::filesystem::remove_tree;
use crate::size::disk_usage;

const ROOTFS_DIR: &str = "rootfs";
const IMAGE_FILE: &str = "image.json";
const METADATA_FILE: &str = "bundle.json";

/// Metadata persisted with every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Bundle ID.
    pub id: BundleId,
    /// Reference of the base image.
    pub source: String,
    /// Chain ids of the base image layers, root first.
    pub chain_ids: Vec<ChainId>,
    /// Disk limit in bytes, 0 for none.
    pub disk_limit_bytes: u64,
    /// Whether the base image is excluded from the disk limit.
    pub exclude_image_from_quota: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A bundle on disk.
#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    /// Bundle metadata.
    #[serde(flatten)]
    pub metadata: BundleMetadata,
    /// Bundle directory.
    pub path: PathBuf,
    /// Root filesystem of the bundle.
    pub rootfs: PathBuf,
}

/// Disk usage of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleStats {
    /// Bundle ID.
    pub id: BundleId,
    /// Bytes used by the bundle's own root filesystem.
    pub exclusive_bytes: u64,
    /// Disk limit in bytes, 0 for none.
    pub disk_limit_bytes: u64,
}

/// Bundles of one store.
#[derive(Debug, Clone)]
pub struct BundleStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BundleStore {
    /// Create a bundle store for `paths`.
    #[must_use]
    pub fn new(paths: &StorePaths) -> Self {
        Self {
            dir: paths.bundles(),
            tmp_dir: paths.tmp(),
        }
    }

    fn bundle_dir(&self, id: &BundleId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Whether a bundle with this ID exists.
    #[must_use]
    pub fn exists(&self, id: &BundleId) -> bool {
        self.bundle_dir(id).join(METADATA_FILE).exists()
    }

    /// Create a bundle. `populate` must create the root filesystem at the
    /// path it is given.
    ///
    /// The bundle only becomes visible once fully written.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleExists`] if the ID is taken, or any error
    /// from `populate` or from writing metadata.
    pub fn create<F>(
        &self,
        metadata: BundleMetadata,
        config: &ImageConfig,
        populate: F,
    ) -> StrataResult<Bundle>
    where
        F: FnOnce(&Path) -> StrataResult<()>,
    {
        let dir = self.bundle_dir(&metadata.id);
        if dir.exists() {
            return Err(StrataError::BundleExists {
                id: metadata.id.to_string(),
            });
        }

        fs::create_dir_all(&self.dir)?;
        fs::create_dir_all(&self.tmp_dir)?;

        let staging = tempfile::Builder::new()
            .prefix(&format!("bundle-{}-", metadata.id))
            .tempdir_in(&self.tmp_dir)?;

        populate(&staging.path().join(ROOTFS_DIR))?;
        fs::write(
            staging.path().join(IMAGE_FILE),
            serde_json::to_vec_pretty(config)?,
        )?;
        fs::write(
            staging.path().join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )?;

        fs::rename(staging.path(), &dir).map_err(|e| {
            if dir.exists() {
                StrataError::BundleExists {
                    id: metadata.id.to_string(),
                }
            } else {
                e.into()
            }
        })?;

        tracing::info!(bundle = %metadata.id, path = %dir.display(), "Bundle created");

        Ok(Bundle {
            rootfs: dir.join(ROOTFS_DIR),
            path: dir,
            metadata,
        })
    }

    /// Load a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleNotFound`] if the bundle does not exist.
    pub fn load(&self, id: &BundleId) -> StrataResult<Bundle> {
        let dir = self.bundle_dir(id);

        let content = match fs::read(dir.join(METADATA_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StrataError::BundleNotFound { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Bundle {
            metadata: serde_json::from_slice(&content)?,
            rootfs: dir.join(ROOTFS_DIR),
            path: dir,
        })
    }

    /// Image configuration stored with a bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle or its configuration is missing.
    pub fn image_config(&self, id: &BundleId) -> StrataResult<ImageConfig> {
        let bundle = self.load(id)?;
        let content = fs::read(bundle.path.join(IMAGE_FILE))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Remove a bundle and everything in it.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleNotFound`] if the bundle does not exist.
    pub fn destroy(&self, id: &BundleId) -> StrataResult<()> {
        let dir = self.bundle_dir(id);
        if !dir.exists() {
            return Err(StrataError::BundleNotFound { id: id.to_string() });
        }

        remove_tree(&dir)?;
        tracing::info!(bundle = %id, "Bundle destroyed");
        Ok(())
    }

    /// All bundles, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle directory cannot be read.
    pub fn list(&self) -> StrataResult<Vec<Bundle>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut bundles = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| BundleId::new(name).ok())
            else {
                continue;
            };

            match self.load(&id) {
                Ok(bundle) => bundles.push(bundle),
                Err(StrataError::BundleNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        bundles.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        Ok(bundles)
    }

    /// Disk usage of a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleNotFound`] if the bundle does not exist.
    pub fn stats(&self, id: &BundleId) -> StrataResult<BundleStats> {
        let bundle = self.load(id)?;
        Ok(BundleStats {
            id: id.clone(),
            exclusive_bytes: disk_usage(&bundle.rootfs)?,
            disk_limit_bytes: bundle.metadata.disk_limit_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(id: &str) -> BundleMetadata {
        BundleMetadata {
            id: BundleId::new(id).unwrap(),
            source: "/images/rootfs.tar".to_string(),
            chain_ids: vec![ChainId::new("a")],
            disk_limit_bytes: 0,
            exclude_image_from_quota: false,
            created_at: Utc::now(),
        }
    }

    fn empty_rootfs(path: &Path) -> StrataResult<()> {
        fs::create_dir(path)?;
        Ok(())
    }

    #[test]
    fn create_load_destroy() {
        let temp = tempfile::tempdir().unwrap();
        let store = BundleStore::new(&StorePaths::with_root(temp.path()));

        let bundle = store
            .create(metadata("b1"), &ImageConfig::default(), |rootfs| {
                fs::create_dir(rootfs)?;
                fs::write(rootfs.join("hello"), b"world")?;
                Ok(())
            })
            .unwrap();
        assert!(bundle.rootfs.join("hello").exists());

        let id = BundleId::new("b1").unwrap();
        let loaded = store.load(&id).unwrap();
        assert_eq!(loaded.metadata, bundle.metadata);
        assert_eq!(store.stats(&id).unwrap().exclusive_bytes, 5);
        assert_eq!(store.image_config(&id).unwrap(), ImageConfig::default());

        store.destroy(&id).unwrap();
        assert!(!store.exists(&id));
        assert!(matches!(
            store.load(&id).unwrap_err(),
            StrataError::BundleNotFound { .. }
        ));
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let temp = tempfile::tempdir().unwrap();
        let store = BundleStore::new(&StorePaths::with_root(temp.path()));

        store
            .create(metadata("b1"), &ImageConfig::default(), empty_rootfs)
            .unwrap();
        let err = store
            .create(metadata("b1"), &ImageConfig::default(), empty_rootfs)
            .unwrap_err();
        assert!(matches!(err, StrataError::BundleExists { .. }));
    }

    #[test]
    fn failed_populate_leaves_nothing_behind() {
        let temp = tempfile::tempdir().unwrap();
        let paths = StorePaths::with_root(temp.path());
        let store = BundleStore::new(&paths);

        let result = store.create(metadata("b1"), &ImageConfig::default(), |_| {
            Err(StrataError::Internal {
                message: "boom".to_string(),
            })
        });

        assert!(result.is_err());
        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(paths.tmp()).unwrap().count(), 0);
    }

    #[test]
    fn list_is_sorted() {
        let temp = tempfile::tempdir().unwrap();
        let store = BundleStore::new(&StorePaths::with_root(temp.path()));

        for id in ["b2", "b1", "b3"] {
            store
                .create(metadata(id), &ImageConfig::default(), empty_rootfs)
                .unwrap();
        }

        let ids: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|b| b.metadata.id.to_string())
            .collect();
        assert_eq!(ids, ["b1", "b2", "b3"]);
    }
}
