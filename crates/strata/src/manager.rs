//! Store orchestration: create, delete and clean.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use strata_common::{
    BundleId, ChainId, IdMappings, ReferenceName, StorePaths, StrataError, StrataResult,
};
use strata_image::{ImageConfig, ImageSource, LayerSource, SourceSelector, TarUnpacker, Unpacker};

use crate::builder::{BaseImage, LayerGraphBuilder, PullSpec};
use crate::bundle::{Bundle, BundleMetadata, BundleStats, BundleStore};
use crate::config::StoreConfig;
use crate::filesystem::remove_tree;
use crate::gc::{CollectReport, GarbageCollector};
use crate::ledger::{DependencyLedger, FileDependencyLedger};
use crate::lock::{GLOBAL_LOCK_KEY, LockManager};
use crate::namespace::NamespaceRecord;
use crate::size::{StoreSizeEstimator, WalkDirSizeEstimator};
use crate::volume::{DirectoryVolumeStore, VolumeStore};

/// A bundle to create.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Base image reference.
    pub image: String,
    /// ID of the new bundle.
    pub id: BundleId,
    /// Disk limit in bytes, 0 for none.
    pub disk_limit_bytes: u64,
    /// Do not count the base image against the disk limit.
    pub exclude_image_from_quota: bool,
    /// Collect unused volumes before pulling.
    pub clean_on_create: bool,
}

impl CreateSpec {
    /// Create `id` from `image` without limits.
    pub fn new(image: impl Into<String>, id: BundleId) -> Self {
        Self {
            image: image.into(),
            id,
            disk_limit_bytes: 0,
            exclude_image_from_quota: false,
            clean_on_create: false,
        }
    }

    /// Apply the defaults of a store configuration.
    #[must_use]
    pub const fn with_config(mut self, config: &StoreConfig) -> Self {
        self.disk_limit_bytes = config.disk_limit_bytes;
        self.exclude_image_from_quota = config.exclude_image_from_quota;
        self.clean_on_create = config.clean_on_create;
        self
    }
}

/// Result of a clean request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CleanOutcome {
    /// The store was below the threshold, nothing was collected.
    Skipped {
        /// Measured store size.
        bytes_used: u64,
    },
    /// A collection pass ran.
    Collected(CollectReport),
}

/// A rootfs store.
pub struct Strata {
    paths: StorePaths,
    mappings: IdMappings,
    volumes: Arc<dyn VolumeStore>,
    source: Arc<dyn LayerSource>,
    unpacker: Arc<dyn Unpacker>,
    ledger: Arc<dyn DependencyLedger>,
    estimator: Arc<dyn StoreSizeEstimator>,
    locks: LockManager,
    bundles: BundleStore,
}

impl Strata {
    /// Initialize the store described by `config` and open it.
    ///
    /// Initializing an existing store again is allowed as long as the id
    /// mappings are the same.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NamespaceMismatch`] if the store was initialized
    /// with other mappings.
    pub fn init_store(config: &StoreConfig) -> StrataResult<Self> {
        let paths = config.paths();
        paths.create_dirs()?;
        let record = NamespaceRecord::ensure(&paths, &config.mappings())?;

        tracing::info!(
            store = %paths.root.display(),
            namespaced = record.mappings.is_namespaced(),
            "Store initialized"
        );

        Ok(Self::with_record(config, paths, record))
    }

    /// Open an initialized store.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::StoreNotInitialized`] if `init_store` never ran
    /// for the store.
    pub fn open(config: &StoreConfig) -> StrataResult<Self> {
        let paths = config.paths();
        let record = NamespaceRecord::load(&paths)?;
        Ok(Self::with_record(config, paths, record))
    }

    fn with_record(config: &StoreConfig, paths: StorePaths, record: NamespaceRecord) -> Self {
        let mut locks = LockManager::new(paths.locks());
        if let Some(timeout) = config.lock_timeout() {
            locks = locks.with_timeout(timeout);
        }

        Self {
            mappings: record.mappings,
            volumes: Arc::new(DirectoryVolumeStore::new(&paths)),
            source: Arc::new(SourceSelector::new()),
            unpacker: Arc::new(TarUnpacker::new()),
            ledger: Arc::new(FileDependencyLedger::new(paths.dependencies())),
            estimator: Arc::new(WalkDirSizeEstimator::new(&paths.root)),
            bundles: BundleStore::new(&paths),
            locks,
            paths,
        }
    }

    /// Use another volume store.
    #[must_use]
    pub fn with_volume_store(mut self, volumes: Arc<dyn VolumeStore>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Use another layer source.
    #[must_use]
    pub fn with_layer_source(mut self, source: Arc<dyn LayerSource>) -> Self {
        self.source = source;
        self
    }

    /// Use another unpacker.
    #[must_use]
    pub fn with_unpacker(mut self, unpacker: Arc<dyn Unpacker>) -> Self {
        self.unpacker = unpacker;
        self
    }

    /// Use another dependency ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn DependencyLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Use another size estimator.
    #[must_use]
    pub fn with_size_estimator(mut self, estimator: Arc<dyn StoreSizeEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Store layout.
    #[must_use]
    pub const fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Id mappings the store was initialized with.
    #[must_use]
    pub const fn mappings(&self) -> &IdMappings {
        &self.mappings
    }

    fn builder(&self) -> LayerGraphBuilder {
        LayerGraphBuilder::new(
            Arc::clone(&self.volumes),
            Arc::clone(&self.source),
            Arc::clone(&self.unpacker),
        )
    }

    fn collector(&self) -> GarbageCollector {
        GarbageCollector::new(Arc::clone(&self.volumes), Arc::clone(&self.ledger))
    }

    /// Create a bundle from a base image.
    ///
    /// Runs entirely under the global store lock.
    ///
    /// # Errors
    ///
    /// Returns any error from resolving, pulling or registering the image.
    /// If registration fails the bundle is removed again.
    pub fn create(&self, spec: &CreateSpec) -> StrataResult<Bundle> {
        let source = ImageSource::parse(&spec.image)?;
        let _lock = self.locks.lock(GLOBAL_LOCK_KEY)?;

        if self.bundles.exists(&spec.id) {
            return Err(StrataError::BundleExists {
                id: spec.id.to_string(),
            });
        }

        if spec.clean_on_create {
            self.clean_before_create(&source);
        }

        let pull = PullSpec::new(source.clone())
            .with_mappings(self.mappings.clone())
            .with_disk_limit(spec.disk_limit_bytes, spec.exclude_image_from_quota);
        let base = self.builder().pull(&pull)?;

        let bundle = self.create_bundle(spec, &source, &base)?;
        self.register(&bundle, &source, &base.chain_ids)?;

        Ok(bundle)
    }

    /// Collect unused volumes, keeping those of the image about to be pulled.
    fn clean_before_create(&self, source: &ImageSource) {
        let keep: BTreeSet<ChainId> = match self.source.resolve(source) {
            Ok(image) => image.layers.into_iter().map(|l| l.chain_id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping clean, base image did not resolve");
                return;
            }
        };

        if let Err(e) = self.collector().collect(&keep) {
            tracing::warn!(error = %e, "Clean before create failed");
        }
    }

    fn create_bundle(
        &self,
        spec: &CreateSpec,
        source: &ImageSource,
        base: &BaseImage,
    ) -> StrataResult<Bundle> {
        let metadata = BundleMetadata {
            id: spec.id.clone(),
            source: source.reference.clone(),
            chain_ids: base.chain_ids.clone(),
            disk_limit_bytes: spec.disk_limit_bytes,
            exclude_image_from_quota: spec.exclude_image_from_quota,
            created_at: Utc::now(),
        };
        let leaf = base.leaf_key(self.mappings.is_namespaced());

        self.bundles
            .create(metadata, &base.config, |rootfs| match &leaf {
                Some(key) => self.volumes.snapshot_into(key, rootfs),
                None => Ok(fs::create_dir(rootfs)?),
            })
    }

    fn register(
        &self,
        bundle: &Bundle,
        source: &ImageSource,
        chain_ids: &[ChainId],
    ) -> StrataResult<()> {
        let bundle_name = ReferenceName::bundle(&bundle.metadata.id);
        let image_name = ReferenceName::image(&source.reference);

        let result = self
            .ledger
            .register(&bundle_name, chain_ids)
            .and_then(|()| self.ledger.register(&image_name, chain_ids));

        if let Err(e) = result {
            if let Err(rollback) = self.bundles.destroy(&bundle.metadata.id) {
                tracing::warn!(bundle = %bundle.metadata.id, error = %rollback, "Failed to remove bundle");
            }
            if let Err(rollback) = self.ledger.deregister(&bundle_name) {
                tracing::warn!(name = %bundle_name, error = %rollback, "Failed to deregister bundle");
            }
            return Err(match e {
                StrataError::DependencyRegistration { .. } => e,
                other => StrataError::DependencyRegistration {
                    name: bundle_name.to_string(),
                    message: other.to_string(),
                },
            });
        }

        Ok(())
    }

    /// Delete a bundle and release its dependencies.
    ///
    /// Shared layer volumes stay until the next clean.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleNotFound`] if neither the bundle nor its
    /// dependency record exists.
    pub fn delete(&self, id: &BundleId) -> StrataResult<()> {
        let name = ReferenceName::bundle(id);

        match self.bundles.destroy(id) {
            Ok(()) => {}
            Err(StrataError::BundleNotFound { .. })
                if self.ledger.dependencies(&name)?.is_some() =>
            {
                tracing::warn!(bundle = %id, "Bundle storage missing, releasing dependencies");
            }
            Err(e) => return Err(e),
        }

        self.ledger.deregister(&name)?;
        tracing::info!(bundle = %id, "Bundle deleted");
        Ok(())
    }

    /// Collect unused volumes unless the store is within `threshold_bytes`.
    ///
    /// A threshold of 0 always collects.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be measured or locked, or
    /// [`StrataError::Collection`] if some volumes could not be destroyed.
    pub fn clean(&self, threshold_bytes: u64) -> StrataResult<CleanOutcome> {
        if threshold_bytes > 0 {
            let bytes_used = self.estimator.measure_store()?;
            if bytes_used <= threshold_bytes {
                tracing::info!(bytes_used, threshold_bytes, "Store below threshold, skipping clean");
                return Ok(CleanOutcome::Skipped { bytes_used });
            }
        }

        let _lock = self.locks.lock(GLOBAL_LOCK_KEY)?;
        let report = self.collector().collect(&BTreeSet::new())?;
        Ok(CleanOutcome::Collected(report))
    }

    /// All bundles in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundles cannot be read.
    pub fn list(&self) -> StrataResult<Vec<Bundle>> {
        self.bundles.list()
    }

    /// Disk usage of a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleNotFound`] if the bundle does not exist.
    pub fn stats(&self, id: &BundleId) -> StrataResult<BundleStats> {
        self.bundles.stats(id)
    }

    /// Image configuration a bundle was created from.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::BundleNotFound`] if the bundle does not exist.
    pub fn image_config(&self, id: &BundleId) -> StrataResult<ImageConfig> {
        self.bundles.image_config(id)
    }

    /// Remove the whole store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be locked or removed.
    pub fn delete_store(self) -> StrataResult<()> {
        let lock = self.locks.lock(GLOBAL_LOCK_KEY)?;
        remove_tree(&self.paths.root)?;
        drop(lock);

        tracing::info!(store = %self.paths.root.display(), "Store deleted");
        Ok(())
    }
}

impl std::fmt::Debug for Strata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strata")
            .field("paths", &self.paths)
            .field("mappings", &self.mappings)
            .finish_non_exhaustive()
    }
}
