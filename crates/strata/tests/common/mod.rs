//! In-memory stand-ins for the external collaborators of the store.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use strata::{VolumeInfo, VolumeStore};
use strata_common::{ChainId, IdMappings, StrataError, StrataResult};
use strata_image::{
    BlobStream, ImageConfig, ImageSource, LayerDescriptor, LayerSource, ResolvedImage,
    UnpackStats, Unpacker,
};

/// Content an unpacker fake refuses.
pub const CORRUPT: &[u8] = b"corrupt";

#[derive(Default)]
struct VolumeState {
    volumes: BTreeMap<String, Option<String>>,
    uncommitted: HashSet<String>,
    created: Vec<String>,
    committed: Vec<String>,
    destroyed: Vec<String>,
    failing_creates: HashSet<String>,
    failing_destroys: HashSet<String>,
}

/// Volume store keeping volumes in memory and recording every call.
#[derive(Default)]
pub struct RecordingVolumeStore {
    state: Mutex<VolumeState>,
}

impl RecordingVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a volume without recording a create.
    pub fn with_volume(self, key: &str, parent: Option<&str>) -> Self {
        self.state
            .lock()
            .volumes
            .insert(key.to_string(), parent.map(str::to_string));
        self
    }

    /// Seed a volume a build started but never committed.
    pub fn with_uncommitted_volume(self, key: &str, parent: Option<&str>) -> Self {
        {
            let mut state = self.state.lock();
            state
                .volumes
                .insert(key.to_string(), parent.map(str::to_string));
            state.uncommitted.insert(key.to_string());
        }
        self
    }

    pub fn fail_create(&self, key: &str) {
        self.state.lock().failing_creates.insert(key.to_string());
    }

    pub fn fail_destroy(&self, key: &str) {
        self.state.lock().failing_destroys.insert(key.to_string());
    }

    /// Keys passed to `create_volume`, in call order.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Keys committed, in call order.
    pub fn committed(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Keys successfully destroyed, in call order.
    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    /// Every volume with its parent key, ordered by key.
    pub fn volumes_with_parents(&self) -> Vec<(String, Option<String>)> {
        self.state
            .lock()
            .volumes
            .iter()
            .map(|(key, parent)| (key.clone(), parent.clone()))
            .collect()
    }

    pub fn create_count(&self, key: &str) -> usize {
        self.state.lock().created.iter().filter(|k| *k == key).count()
    }

    fn path(key: &str) -> PathBuf {
        PathBuf::from("/fake/volumes").join(key)
    }
}

impl VolumeStore for RecordingVolumeStore {
    fn volume_path(&self, key: &str) -> StrataResult<PathBuf> {
        let state = self.state.lock();
        if state.volumes.contains_key(key) && !state.uncommitted.contains(key) {
            Ok(Self::path(key))
        } else {
            Err(StrataError::VolumeNotFound {
                key: key.to_string(),
            })
        }
    }

    fn create_volume(&self, parent: Option<&str>, key: &str) -> StrataResult<PathBuf> {
        let mut state = self.state.lock();
        state.created.push(key.to_string());

        let creation = |message: &str| StrataError::VolumeCreation {
            key: key.to_string(),
            message: message.to_string(),
        };

        if state.failing_creates.contains(key) {
            return Err(creation("injected failure"));
        }
        if state.volumes.contains_key(key) && !state.uncommitted.contains(key) {
            return Err(creation("volume already exists"));
        }
        if let Some(parent) = parent {
            if !state.volumes.contains_key(parent) || state.uncommitted.contains(parent) {
                return Err(creation("parent missing"));
            }
        }

        state
            .volumes
            .insert(key.to_string(), parent.map(str::to_string));
        state.uncommitted.insert(key.to_string());
        Ok(Self::path(key))
    }

    fn commit_volume(&self, key: &str) -> StrataResult<()> {
        let mut state = self.state.lock();
        if !state.volumes.contains_key(key) {
            return Err(StrataError::VolumeNotFound {
                key: key.to_string(),
            });
        }

        state.uncommitted.remove(key);
        state.committed.push(key.to_string());
        Ok(())
    }

    fn destroy_volume(&self, key: &str) -> StrataResult<()> {
        let mut state = self.state.lock();

        if state.failing_destroys.contains(key) {
            return Err(StrataError::VolumeDestroy {
                key: key.to_string(),
                message: "device busy".to_string(),
            });
        }
        if state.volumes.remove(key).is_none() {
            return Err(StrataError::VolumeNotFound {
                key: key.to_string(),
            });
        }
        state.uncommitted.remove(key);

        state.destroyed.push(key.to_string());
        Ok(())
    }

    fn volumes(&self) -> StrataResult<Vec<VolumeInfo>> {
        Ok(self
            .state
            .lock()
            .volumes
            .iter()
            .map(|(key, parent)| VolumeInfo {
                key: key.clone(),
                parent: parent.clone(),
                path: Self::path(key),
            })
            .collect())
    }

    fn snapshot_into(&self, key: &str, dest: &Path) -> StrataResult<()> {
        self.volume_path(key)?;
        std::fs::create_dir_all(dest)?;
        Ok(())
    }
}

/// Build descriptors for a stack of `(chain_id, content)` layers.
pub fn stack(layers: &[(&str, &[u8])]) -> Vec<(LayerDescriptor, Vec<u8>)> {
    layers
        .iter()
        .enumerate()
        .map(|(i, (chain, content))| {
            let descriptor = LayerDescriptor {
                blob_id: format!("blob-{chain}"),
                chain_id: ChainId::new(chain),
                parent_chain_id: i.checked_sub(1).map(|p| ChainId::new(layers[p].0)),
                size_bytes: content.len() as u64,
            };
            (descriptor, content.to_vec())
        })
        .collect()
}

/// Layer source serving images registered up front.
#[derive(Default)]
pub struct ScriptedLayerSource {
    images: Mutex<HashMap<String, Vec<(LayerDescriptor, Vec<u8>)>>>,
    streamed: Mutex<Vec<String>>,
}

impl ScriptedLayerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, reference: &str, layers: &[(&str, &[u8])]) -> Self {
        self.images
            .lock()
            .insert(reference.to_string(), stack(layers));
        self
    }

    /// Blob ids streamed so far.
    pub fn streamed(&self) -> Vec<String> {
        self.streamed.lock().clone()
    }
}

impl LayerSource for ScriptedLayerSource {
    fn resolve(&self, source: &ImageSource) -> StrataResult<ResolvedImage> {
        let images = self.images.lock();
        let layers = images
            .get(&source.reference)
            .ok_or_else(|| StrataError::SourceResolution {
                reference: source.reference.clone(),
                message: "image not found".to_string(),
            })?;

        Ok(ResolvedImage {
            layers: layers.iter().map(|(d, _)| d.clone()).collect(),
            config: ImageConfig::default(),
        })
    }

    fn stream_blob(&self, source: &ImageSource, blob_id: &str) -> StrataResult<BlobStream> {
        let images = self.images.lock();
        let content = images
            .get(&source.reference)
            .and_then(|layers| layers.iter().find(|(d, _)| d.blob_id == blob_id))
            .map(|(_, content)| content.clone())
            .ok_or_else(|| StrataError::SourceResolution {
                reference: source.reference.clone(),
                message: format!("blob {blob_id} not found"),
            })?;

        self.streamed.lock().push(blob_id.to_string());
        Ok(Box::new(Cursor::new(content)))
    }
}

/// Unpacker that reads the stream and rejects [`CORRUPT`] content.
#[derive(Default)]
pub struct CheckingUnpacker {
    applied: Mutex<Vec<PathBuf>>,
}

impl CheckingUnpacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets unpacked into, in call order.
    pub fn applied(&self) -> Vec<PathBuf> {
        self.applied.lock().clone()
    }
}

impl Unpacker for CheckingUnpacker {
    fn apply(
        &self,
        mut stream: BlobStream,
        target: &Path,
        _mappings: &IdMappings,
    ) -> StrataResult<UnpackStats> {
        let mut content = Vec::new();
        stream.read_to_end(&mut content)?;
        self.applied.lock().push(target.to_path_buf());

        if content == CORRUPT {
            return Err(StrataError::Internal {
                message: "unexpected end of archive".to_string(),
            });
        }

        Ok(UnpackStats {
            entries: 1,
            whiteouts: 0,
        })
    }
}
