//! Standard filesystem paths for a Strata store.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default store directory.
pub static STRATA_STORE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/strata"))
});

/// Layout of a store on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Store root directory (default: /var/lib/strata).
    pub root: PathBuf,
}

impl StorePaths {
    /// Create paths with the default store location.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom store directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default store for an unprivileged user.
    #[must_use]
    pub fn rootless() -> Self {
        let data = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::with_root(data.join("strata"))
    }

    /// Directory holding one subdirectory per layer volume.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Directory of a single volume.
    #[must_use]
    pub fn volume(&self, key: &str) -> PathBuf {
        self.volumes().join(key)
    }

    /// Directory holding one subdirectory per bundle.
    #[must_use]
    pub fn bundles(&self) -> PathBuf {
        self.root.join("bundles")
    }

    /// Directory of a single bundle.
    #[must_use]
    pub fn bundle(&self, id: &str) -> PathBuf {
        self.bundles().join(id)
    }

    /// Store metadata directory.
    #[must_use]
    pub fn meta(&self) -> PathBuf {
        self.root.join("meta")
    }

    /// Dependency records, one file per reference name.
    #[must_use]
    pub fn dependencies(&self) -> PathBuf {
        self.meta().join("dependencies")
    }

    /// Id mappings the store was initialized with.
    #[must_use]
    pub fn namespace_file(&self) -> PathBuf {
        self.meta().join("namespace.json")
    }

    /// Lock files.
    #[must_use]
    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Scratch space for volumes under construction.
    #[must_use]
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(self.bundles())?;
        std::fs::create_dir_all(self.dependencies())?;
        std::fs::create_dir_all(self.locks())?;
        std::fs::create_dir_all(self.tmp())?;
        Ok(())
    }
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            root: STRATA_STORE.clone(),
        }
    }
}
