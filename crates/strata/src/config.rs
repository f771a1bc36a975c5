//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_common::paths::STRATA_STORE;
use strata_common::{IdMapping, IdMappings, StorePaths, StrataError, StrataResult};

/// Store configuration options.
///
/// Loaded from YAML, with every field optional:
///
/// ```yaml
/// store: /var/lib/strata
/// uid_mappings:
///   - { namespace_id: 0, host_id: 100000, size: 65536 }
/// disk_limit_bytes: 1073741824
/// clean_threshold_bytes: 10737418240
/// clean_on_create: true
/// lock_timeout: 30
/// log_level: debug
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Store directory.
    pub store: PathBuf,
    /// UID mappings for new stores.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for new stores.
    pub gid_mappings: Vec<IdMapping>,
    /// Default disk limit of new bundles in bytes, 0 for none.
    pub disk_limit_bytes: u64,
    /// Do not count the base image against the disk limit.
    pub exclude_image_from_quota: bool,
    /// Skip cleaning while the store uses at most this many bytes, 0 to
    /// always clean.
    pub clean_threshold_bytes: u64,
    /// Collect unused volumes before every create.
    pub clean_on_create: bool,
    /// Seconds to wait for the store lock, unset to wait forever.
    pub lock_timeout: Option<u64>,
    /// Default log level.
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store: STRATA_STORE.clone(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            disk_limit_bytes: 0,
            exclude_image_from_quota: false,
            clean_threshold_bytes: 0,
            clean_on_create: false,
            lock_timeout: None,
            log_level: "info".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;

        serde_yaml::from_str(&content).map_err(|e| StrataError::Config {
            message: format!("invalid config {}: {e}", path.display()),
        })
    }

    /// Set the store directory.
    #[must_use]
    pub fn with_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.store = store.into();
        self
    }

    /// Set the id mappings used when initializing a store.
    #[must_use]
    pub fn with_mappings(mut self, mappings: IdMappings) -> Self {
        self.uid_mappings = mappings.uid;
        self.gid_mappings = mappings.gid;
        self
    }

    /// Set the default disk limit.
    #[must_use]
    pub const fn with_disk_limit(mut self, bytes: u64) -> Self {
        self.disk_limit_bytes = bytes;
        self
    }

    /// Set the clean threshold.
    #[must_use]
    pub const fn with_clean_threshold(mut self, bytes: u64) -> Self {
        self.clean_threshold_bytes = bytes;
        self
    }

    /// Collect unused volumes before every create.
    #[must_use]
    pub const fn with_clean_on_create(mut self) -> Self {
        self.clean_on_create = true;
        self
    }

    /// Set the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout.as_secs());
        self
    }

    /// Store layout.
    #[must_use]
    pub fn paths(&self) -> StorePaths {
        StorePaths::with_root(&self.store)
    }

    /// Id mappings.
    #[must_use]
    pub fn mappings(&self) -> IdMappings {
        IdMappings::new(self.uid_mappings.clone(), self.gid_mappings.clone())
    }

    /// Lock timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.disk_limit_bytes, 0);
        assert!(!config.clean_on_create);
        assert!(config.lock_timeout().is_none());
        assert!(!config.mappings().is_namespaced());
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::default()
            .with_store("/custom/store")
            .with_disk_limit(1024)
            .with_clean_threshold(4096)
            .with_clean_on_create()
            .with_lock_timeout(Duration::from_secs(5));

        assert_eq!(config.paths().root, PathBuf::from("/custom/store"));
        assert_eq!(config.disk_limit_bytes, 1024);
        assert_eq!(config.clean_threshold_bytes, 4096);
        assert!(config.clean_on_create);
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn loads_yaml() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("strata.yaml");
        std::fs::write(
            &path,
            "store: /srv/strata\n\
             uid_mappings:\n  - { namespace_id: 0, host_id: 100000, size: 65536 }\n\
             clean_on_create: true\n\
             lock_timeout: 30\n",
        )
        .unwrap();

        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.store, PathBuf::from("/srv/strata"));
        assert!(config.mappings().is_namespaced());
        assert!(config.clean_on_create);
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("strata.yaml");
        std::fs::write(&path, "stroe: /typo\n").unwrap();

        assert!(matches!(
            StoreConfig::from_file(&path).unwrap_err(),
            StrataError::Config { .. }
        ));
    }
}
