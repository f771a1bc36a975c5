//! OCI image layouts on the local filesystem.
//!
//! A layout directory holds an `index.json` pointing at one or more
//! manifests, and content-addressed blobs under `blobs/<algorithm>/<hash>`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use strata_common::{Digest, StrataError, StrataResult};

use crate::descriptor::{self, ContentDescriptor, ImageConfig, ImageIndex, ImageManifest};
use crate::reference::{ImageSource, SourceKind};
use crate::source::{BlobStream, LayerSource, ResolvedImage};

const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const DEFAULT_TAG: &str = "latest";

/// Reads images from OCI image layout directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct OciLayoutSource;

impl OciLayoutSource {
    /// Create an OCI layout source.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn layout(source: &ImageSource) -> StrataResult<(&Path, Option<&str>)> {
        match &source.kind {
            SourceKind::OciLayout { path, tag } => Ok((path.as_path(), tag.as_deref())),
            _ => Err(StrataError::SourceResolution {
                reference: source.reference.clone(),
                message: "not an OCI layout".to_string(),
            }),
        }
    }

    /// Get the path for a blob.
    fn blob_path(layout: &Path, digest: &str) -> StrataResult<PathBuf> {
        let digest: Digest = digest.parse()?;
        Ok(layout.join(BLOBS_DIR).join(digest.algorithm).join(digest.hash))
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> StrataResult<T> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Pick the manifest for `tag`, or the only manifest when no tag is given.
    fn select_manifest<'a>(
        index: &'a ImageIndex,
        tag: Option<&str>,
    ) -> Result<&'a ContentDescriptor, String> {
        match tag {
            Some(tag) => index
                .manifests
                .iter()
                .find(|m| m.ref_name() == Some(tag))
                .ok_or_else(|| format!("tag {tag} not found in layout")),
            None => match index.manifests.as_slice() {
                [only] => Ok(only),
                [] => Err("layout has no manifests".to_string()),
                many => many
                    .iter()
                    .find(|m| m.ref_name() == Some(DEFAULT_TAG))
                    .ok_or_else(|| "layout has several manifests, a tag is required".to_string()),
            },
        }
    }

    fn read_image(layout: &Path, tag: Option<&str>) -> Result<ResolvedImage, String> {
        let index: ImageIndex = Self::read_json(&layout.join(INDEX_FILE))
            .map_err(|e| format!("failed to read {INDEX_FILE}: {e}"))?;
        let manifest_desc = Self::select_manifest(&index, tag)?;

        let manifest: ImageManifest = Self::blob_path(layout, &manifest_desc.digest)
            .and_then(|p| Self::read_json(&p))
            .map_err(|e| format!("failed to read manifest {}: {e}", manifest_desc.digest))?;

        let config: ImageConfig = Self::blob_path(layout, &manifest.config.digest)
            .and_then(|p| Self::read_json(&p))
            .map_err(|e| format!("failed to read config {}: {e}", manifest.config.digest))?;

        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(format!(
                "manifest lists {} layers but config lists {} diff ids",
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            ));
        }

        let blobs: Vec<(String, u64)> = manifest
            .layers
            .iter()
            .map(|l| (l.digest.clone(), l.size))
            .collect();
        let layers = descriptor::descriptors(&blobs, &config.rootfs.diff_ids);

        Ok(ResolvedImage { layers, config })
    }
}

impl LayerSource for OciLayoutSource {
    fn resolve(&self, source: &ImageSource) -> StrataResult<ResolvedImage> {
        let (layout, tag) = Self::layout(source)?;

        let image = Self::read_image(layout, tag).map_err(|message| {
            StrataError::SourceResolution {
                reference: source.reference.clone(),
                message,
            }
        })?;

        tracing::debug!(
            reference = %source.reference,
            layers = image.layers.len(),
            "Resolved OCI layout"
        );

        Ok(image)
    }

    fn stream_blob(&self, source: &ImageSource, blob_id: &str) -> StrataResult<BlobStream> {
        let (layout, _) = Self::layout(source)?;
        let path = Self::blob_path(layout, blob_id)?;

        let file = File::open(&path).map_err(|e| StrataError::SourceResolution {
            reference: source.reference.clone(),
            message: format!("failed to open blob {blob_id}: {e}"),
        })?;
        Ok(Box::new(file))
    }
}
