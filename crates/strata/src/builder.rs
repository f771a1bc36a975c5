//! Layer graph builder.
//!
//! Turns the layer descriptors of a base image into a stack of volumes,
//! materializing each layer at most once. The volume store doubles as the
//! cache: a layer whose volume is committed is never fetched again, and
//! neither are any of the layers below it. A volume is committed only once
//! its layer is fully unpacked.
//!
//! Cache hits are trusted on existence alone. A volume whose ancestors were
//! removed behind the store's back is not re-validated.

use std::path::PathBuf;
use std::sync::Arc;

use strata_common::{ChainId, IdMappings, StrataError, StrataResult};
use strata_image::{ImageConfig, ImageSource, LayerDescriptor, LayerSource, Unpacker};

use crate::volume::VolumeStore;

/// What to pull and under which constraints.
#[derive(Debug, Clone)]
pub struct PullSpec {
    /// The base image.
    pub source: ImageSource,
    /// UID/GID mappings applied while unpacking.
    pub mappings: IdMappings,
    /// Disk limit in bytes, 0 for none.
    pub disk_limit_bytes: u64,
    /// Do not count the base image against the disk limit.
    pub exclude_base_image_from_quota: bool,
}

impl PullSpec {
    /// Pull `source` with identity mappings and no quota.
    #[must_use]
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            mappings: IdMappings::default(),
            disk_limit_bytes: 0,
            exclude_base_image_from_quota: false,
        }
    }

    /// Set the UID/GID mappings.
    #[must_use]
    pub fn with_mappings(mut self, mappings: IdMappings) -> Self {
        self.mappings = mappings;
        self
    }

    /// Set the disk limit.
    #[must_use]
    pub const fn with_disk_limit(mut self, bytes: u64, exclude_base_image: bool) -> Self {
        self.disk_limit_bytes = bytes;
        self.exclude_base_image_from_quota = exclude_base_image;
        self
    }

    fn is_quota_enforced(&self) -> bool {
        self.disk_limit_bytes > 0 && !self.exclude_base_image_from_quota
    }
}

/// A pulled base image.
#[derive(Debug, Clone)]
pub struct BaseImage {
    /// Content of the topmost volume, `None` for an image without layers.
    pub volume_path: Option<PathBuf>,
    /// Chain ids of every layer, root first.
    pub chain_ids: Vec<ChainId>,
    /// The image configuration.
    pub config: ImageConfig,
}

impl BaseImage {
    /// Volume key of the topmost layer.
    #[must_use]
    pub fn leaf_key(&self, namespaced: bool) -> Option<String> {
        self.chain_ids.last().map(|c| c.volume_key(namespaced))
    }
}

/// Builds and reuses layer volumes.
pub struct LayerGraphBuilder {
    volumes: Arc<dyn VolumeStore>,
    source: Arc<dyn LayerSource>,
    unpacker: Arc<dyn Unpacker>,
}

impl LayerGraphBuilder {
    /// Create a builder over the given collaborators.
    pub fn new(
        volumes: Arc<dyn VolumeStore>,
        source: Arc<dyn LayerSource>,
        unpacker: Arc<dyn Unpacker>,
    ) -> Self {
        Self {
            volumes,
            source,
            unpacker,
        }
    }

    /// Materialize every layer of the image and return the topmost volume.
    ///
    /// # Errors
    ///
    /// - [`StrataError::SourceResolution`] if the image cannot be resolved
    /// - [`StrataError::QuotaExceeded`] before any volume is touched
    /// - [`StrataError::VolumeCreation`] if a volume cannot be created
    /// - [`StrataError::LayerCorrupted`] if a layer fails to unpack, after
    ///   its volume was removed again
    pub fn pull(&self, spec: &PullSpec) -> StrataResult<BaseImage> {
        let image = self.source.resolve(&spec.source)?;
        Self::check_quota(spec, &image.layers)?;

        let volume_path = self.build(spec, &image.layers)?;
        let chain_ids = image.layers.iter().map(|l| l.chain_id.clone()).collect();

        tracing::info!(
            reference = %spec.source,
            layers = image.layers.len(),
            namespaced = spec.mappings.is_namespaced(),
            "Base image ready"
        );

        Ok(BaseImage {
            volume_path,
            chain_ids,
            config: image.config,
        })
    }

    fn check_quota(spec: &PullSpec, layers: &[LayerDescriptor]) -> StrataResult<()> {
        if !spec.is_quota_enforced() {
            return Ok(());
        }

        let required = layers
            .iter()
            .fold(0u64, |sum, l| sum.saturating_add(l.size_bytes));

        if required > spec.disk_limit_bytes {
            return Err(StrataError::QuotaExceeded {
                reference: spec.source.to_string(),
                required,
                limit: spec.disk_limit_bytes,
            });
        }

        Ok(())
    }

    /// Find the highest cached layer, then build everything above it.
    fn build(&self, spec: &PullSpec, layers: &[LayerDescriptor]) -> StrataResult<Option<PathBuf>> {
        let namespaced = spec.mappings.is_namespaced();
        let mut first_missing = 0;
        let mut path = None;

        for (index, layer) in layers.iter().enumerate().rev() {
            let key = layer.chain_id.volume_key(namespaced);
            match self.volumes.volume_path(&key) {
                Ok(existing) => {
                    tracing::debug!(index, key = %key, "Layer volume cached");
                    first_missing = index + 1;
                    path = Some(existing);
                    break;
                }
                Err(e) if e.is_volume_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        for index in first_missing..layers.len() {
            path = Some(self.build_layer(spec, layers, index, namespaced)?);
        }

        Ok(path)
    }

    fn build_layer(
        &self,
        spec: &PullSpec,
        layers: &[LayerDescriptor],
        index: usize,
        namespaced: bool,
    ) -> StrataResult<PathBuf> {
        let layer = &layers[index];
        let key = layer.chain_id.volume_key(namespaced);
        let parent = index
            .checked_sub(1)
            .map(|p| layers[p].chain_id.volume_key(namespaced));

        let stream = self.source.stream_blob(&spec.source, &layer.blob_id)?;
        let path = self.volumes.create_volume(parent.as_deref(), &key)?;

        let stats = match self.unpacker.apply(stream, &path, &spec.mappings) {
            Ok(stats) => stats,
            Err(e) => {
                self.discard(&key, "Failed to remove volume of corrupted layer");
                return Err(StrataError::LayerCorrupted {
                    index,
                    chain_id: layer.chain_id.to_string(),
                    blob_id: layer.blob_id.clone(),
                    message: e.to_string(),
                });
            }
        };

        if let Err(e) = self.volumes.commit_volume(&key) {
            self.discard(&key, "Failed to remove uncommitted volume");
            return Err(e);
        }

        tracing::info!(
            index,
            key = %key,
            chain_id = %layer.chain_id,
            entries = stats.entries,
            "Layer materialized"
        );
        Ok(path)
    }

    /// Best-effort removal of a volume that will never be committed.
    fn discard(&self, key: &str, message: &str) {
        if let Err(e) = self.volumes.destroy_volume(key) {
            tracing::warn!(key = %key, error = %e, "{message}");
        }
    }
}

impl std::fmt::Debug for LayerGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerGraphBuilder").finish_non_exhaustive()
    }
}
