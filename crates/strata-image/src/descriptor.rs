//! Layer descriptors and image metadata.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_common::ChainId;

/// One layer of a base image, as resolved from its source.
///
/// Descriptors of an image are always ordered bottom to top: the root layer
/// comes first and every following layer names its predecessor as parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Blob to stream the layer content from.
    pub blob_id: String,
    /// Id of this layer's content together with all of its ancestry.
    pub chain_id: ChainId,
    /// Chain id of the layer below, `None` for the root layer.
    pub parent_chain_id: Option<ChainId>,
    /// Size of the blob in bytes, used for quota checks.
    pub size_bytes: u64,
}

/// Derive chain ids from the diff ids of an image, bottom to top.
///
/// The first chain id is the first diff id; each following one is
/// `sha256(parent_chain_id + " " + diff_id)`.
#[must_use]
pub fn chain_ids(diff_ids: &[String]) -> Vec<ChainId> {
    let mut chain: Vec<ChainId> = Vec::with_capacity(diff_ids.len());
    let mut previous: Option<String> = None;

    for diff_id in diff_ids {
        let next = match previous {
            None => diff_id.clone(),
            Some(parent) => {
                let hash = Sha256::digest(format!("{parent} {diff_id}").as_bytes());
                format!("sha256:{}", hex::encode(hash))
            }
        };
        chain.push(ChainId::new(&next));
        previous = Some(next);
    }

    chain
}

/// Build descriptors from parallel lists of blobs and their diff ids.
///
/// `layers` holds `(blob_id, size_bytes)` pairs in bottom-to-top order.
#[must_use]
pub fn descriptors(layers: &[(String, u64)], diff_ids: &[String]) -> Vec<LayerDescriptor> {
    let chain = chain_ids(diff_ids);

    layers
        .iter()
        .zip(&chain)
        .enumerate()
        .map(|(i, ((blob_id, size_bytes), chain_id))| LayerDescriptor {
            blob_id: blob_id.clone(),
            chain_id: chain_id.clone(),
            parent_chain_id: i.checked_sub(1).map(|p| chain[p].clone()),
            size_bytes: *size_bytes,
        })
        .collect()
}

/// OCI Image Manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: ContentDescriptor,
    /// Layer descriptors.
    pub layers: Vec<ContentDescriptor>,
}

/// OCI Image Index, as found at the top of an image layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Manifests in the layout.
    pub manifests: Vec<ContentDescriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDescriptor {
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size.
    pub size: u64,
    /// Annotations.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub annotations: std::collections::HashMap<String, String>,
}

impl ContentDescriptor {
    /// Annotation carrying the tag of a manifest inside an image layout.
    pub const REF_NAME: &'static str = "org.opencontainers.image.ref.name";

    /// The tag this descriptor is published under, if any.
    #[must_use]
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(Self::REF_NAME).map(String::as_str)
    }
}

/// OCI Image Config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// OS.
    #[serde(default)]
    pub os: String,
    /// Created timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Config.
    #[serde(default)]
    pub config: RuntimeConfig,
    /// Rootfs.
    #[serde(default)]
    pub rootfs: Rootfs,
}

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Entrypoint.
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Cmd.
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Environment variables.
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// User.
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Rootfs configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rootfs {
    /// Type.
    #[serde(rename = "type", default)]
    pub fs_type: String,
    /// Layer diff IDs.
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_chain_id_is_first_diff_id() {
        let chain = chain_ids(&["sha256:aaa".to_string()]);
        assert_eq!(chain, vec![ChainId::new("aaa")]);
    }

    #[test]
    fn chain_ids_fold_in_ancestry() {
        let diff = vec!["sha256:aaa".to_string(), "sha256:bbb".to_string()];
        let chain = chain_ids(&diff);

        let expected = hex::encode(Sha256::digest(b"sha256:aaa sha256:bbb"));
        assert_eq!(chain[1].as_str(), expected);
    }

    #[test]
    fn same_content_different_ancestry_differs() {
        let a = chain_ids(&["sha256:111".to_string(), "sha256:ccc".to_string()]);
        let b = chain_ids(&["sha256:222".to_string(), "sha256:ccc".to_string()]);
        assert_ne!(a[1], b[1]);
    }

    #[test]
    fn descriptors_link_parents() {
        let layers = vec![
            ("sha256:blob1".to_string(), 10),
            ("sha256:blob2".to_string(), 20),
        ];
        let diff = vec!["sha256:aaa".to_string(), "sha256:bbb".to_string()];
        let descs = descriptors(&layers, &diff);

        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].parent_chain_id, None);
        assert_eq!(descs[1].parent_chain_id.as_ref(), Some(&descs[0].chain_id));
        assert_eq!(descs[1].blob_id, "sha256:blob2");
        assert_eq!(descs[1].size_bytes, 20);
    }

    #[test]
    fn config_parses_docker_style_keys() {
        let json = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/bin"], "Cmd": ["sh"]},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aaa"]}
        }"#;
        let config: ImageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.config.cmd, Some(vec!["sh".to_string()]));
        assert_eq!(config.rootfs.diff_ids.len(), 1);
    }
}
