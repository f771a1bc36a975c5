//! Layer sources.
//!
//! A layer source turns a base image reference into its ordered layer
//! descriptors and streams the content of individual layers on demand.

use std::io::Read;

use strata_common::{StrataError, StrataResult};

use crate::descriptor::{ImageConfig, LayerDescriptor};
use crate::local::LocalTarSource;
use crate::oci::OciLayoutSource;
use crate::reference::{ImageSource, SourceKind};

/// Byte stream of one layer blob.
pub type BlobStream = Box<dyn Read + Send>;

/// A base image resolved into its layers.
#[derive(Debug, Clone, Default)]
pub struct ResolvedImage {
    /// Layer descriptors, root layer first.
    pub layers: Vec<LayerDescriptor>,
    /// The image configuration.
    pub config: ImageConfig,
}

/// Source of layer descriptors and layer content.
pub trait LayerSource: Send + Sync {
    /// Resolve an image into its layer descriptors, bottom to top.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::SourceResolution`] if the image cannot be found
    /// or its metadata is unreadable.
    fn resolve(&self, source: &ImageSource) -> StrataResult<ResolvedImage>;

    /// Open the content of one layer blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be opened.
    fn stream_blob(&self, source: &ImageSource, blob_id: &str) -> StrataResult<BlobStream>;
}

/// Dispatches to the source matching the scheme of the reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceSelector {
    local: LocalTarSource,
    oci: OciLayoutSource,
}

impl SourceSelector {
    /// Create a selector over the built-in sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pick(&self, source: &ImageSource) -> StrataResult<&dyn LayerSource> {
        match source.kind {
            SourceKind::LocalTar { .. } => Ok(&self.local),
            SourceKind::OciLayout { .. } => Ok(&self.oci),
            SourceKind::Registry { .. } => Err(StrataError::Unsupported {
                feature: format!("pulling {} from a remote registry", source.reference),
            }),
        }
    }
}

impl LayerSource for SourceSelector {
    fn resolve(&self, source: &ImageSource) -> StrataResult<ResolvedImage> {
        self.pick(source)?.resolve(source)
    }

    fn stream_blob(&self, source: &ImageSource, blob_id: &str) -> StrataResult<BlobStream> {
        self.pick(source)?.stream_blob(source, blob_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_sources_are_rejected() {
        let selector = SourceSelector::new();
        let source = ImageSource::parse("docker:///library/alpine").unwrap();

        let err = selector.resolve(&source).unwrap_err();
        assert!(matches!(err, StrataError::Unsupported { .. }));
    }

    #[test]
    fn local_sources_are_dispatched() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("missing.tar");
        let selector = SourceSelector::new();
        let source = ImageSource::parse(missing.to_str().unwrap()).unwrap();

        let err = selector.resolve(&source).unwrap_err();
        assert!(matches!(err, StrataError::SourceResolution { .. }));
    }
}
