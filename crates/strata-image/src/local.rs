//! Local rootfs tarballs as single-layer images.

use std::fs::File;
use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use strata_common::{ChainId, StrataError, StrataResult};

use crate::descriptor::{ImageConfig, LayerDescriptor};
use crate::reference::{ImageSource, SourceKind};
use crate::source::{BlobStream, LayerSource, ResolvedImage};

/// Reads a local tarball as an image with exactly one layer.
///
/// The chain id is derived from the absolute path and the modification time
/// of the tarball, so replacing the file yields a fresh volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTarSource;

impl LocalTarSource {
    /// Create a local tarball source.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn tar_path(source: &ImageSource) -> StrataResult<&Path> {
        match &source.kind {
            SourceKind::LocalTar { path } => Ok(path.as_path()),
            _ => Err(StrataError::SourceResolution {
                reference: source.reference.clone(),
                message: "not a local tarball".to_string(),
            }),
        }
    }

    fn chain_id(path: &Path, mtime_nanos: u128) -> ChainId {
        let hash = Sha256::digest(format!("{}-{mtime_nanos}", path.display()).as_bytes());
        ChainId::new(hex::encode(hash))
    }
}

impl LayerSource for LocalTarSource {
    fn resolve(&self, source: &ImageSource) -> StrataResult<ResolvedImage> {
        let path = Self::tar_path(source)?;
        let resolution = |message: String| StrataError::SourceResolution {
            reference: source.reference.clone(),
            message,
        };

        let path = path
            .canonicalize()
            .map_err(|e| resolution(format!("image not found: {e}")))?;
        let meta = path
            .metadata()
            .map_err(|e| resolution(format!("failed to stat {}: {e}", path.display())))?;

        if !meta.is_file() {
            return Err(resolution(format!("{} is not a file", path.display())));
        }

        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());

        let layer = LayerDescriptor {
            blob_id: path.display().to_string(),
            chain_id: Self::chain_id(&path, mtime_nanos),
            parent_chain_id: None,
            size_bytes: meta.len(),
        };

        tracing::debug!(
            reference = %source.reference,
            chain_id = %layer.chain_id,
            size = layer.size_bytes,
            "Resolved local tarball"
        );

        Ok(ResolvedImage {
            layers: vec![layer],
            config: ImageConfig::default(),
        })
    }

    fn stream_blob(&self, source: &ImageSource, blob_id: &str) -> StrataResult<BlobStream> {
        Self::tar_path(source)?;
        let file = File::open(blob_id).map_err(|e| StrataError::SourceResolution {
            reference: source.reference.clone(),
            message: format!("failed to open {blob_id}: {e}"),
        })?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn resolves_single_layer() {
        let temp = tempfile::tempdir().unwrap();
        let tar = temp.path().join("rootfs.tar");
        std::fs::write(&tar, b"not really a tar").unwrap();

        let source = ImageSource::parse(tar.to_str().unwrap()).unwrap();
        let image = LocalTarSource::new().resolve(&source).unwrap();

        assert_eq!(image.layers.len(), 1);
        assert_eq!(image.layers[0].size_bytes, 16);
        assert!(image.layers[0].parent_chain_id.is_none());

        let mut content = String::new();
        LocalTarSource::new()
            .stream_blob(&source, &image.layers[0].blob_id)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "not really a tar");
    }

    #[test]
    fn chain_id_is_stable_for_unchanged_file() {
        let temp = tempfile::tempdir().unwrap();
        let tar = temp.path().join("rootfs.tar");
        std::fs::write(&tar, b"content").unwrap();

        let source = ImageSource::parse(tar.to_str().unwrap()).unwrap();
        let first = LocalTarSource::new().resolve(&source).unwrap();
        let second = LocalTarSource::new().resolve(&source).unwrap();
        assert_eq!(first.layers[0].chain_id, second.layers[0].chain_id);
    }

    #[test]
    fn chain_id_depends_on_mtime() {
        let path = Path::new("/images/rootfs.tar");
        assert_ne!(
            LocalTarSource::chain_id(path, 1),
            LocalTarSource::chain_id(path, 2)
        );
    }

    #[test]
    fn directories_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let source = ImageSource::parse(temp.path().to_str().unwrap()).unwrap();
        assert!(LocalTarSource::new().resolve(&source).is_err());
    }
}
