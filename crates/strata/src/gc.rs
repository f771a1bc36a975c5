//! Garbage collection of unreferenced volumes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use strata_common::{ChainId, StrataError, StrataResult};

use crate::ledger::DependencyLedger;
use crate::volume::{VolumeInfo, VolumeStore};

/// Outcome of a successful collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    /// Keys of the volumes destroyed, in destroy order.
    pub destroyed: Vec<String>,
    /// Keys of the volumes kept.
    pub kept: Vec<String>,
}

/// Destroys volumes no dependency record refers to.
///
/// Callers must hold the global store lock so the live set cannot change
/// while volumes are being destroyed.
pub struct GarbageCollector {
    volumes: Arc<dyn VolumeStore>,
    ledger: Arc<dyn DependencyLedger>,
}

impl GarbageCollector {
    /// Create a collector over a volume store and its ledger.
    pub fn new(volumes: Arc<dyn VolumeStore>, ledger: Arc<dyn DependencyLedger>) -> Self {
        Self { volumes, ledger }
    }

    /// Destroy every volume whose chain id is neither registered nor in
    /// `keep_extra`.
    ///
    /// Volumes are destroyed children first. A failed destroy does not stop
    /// the pass.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Collection`] listing every volume that could not
    /// be destroyed, or an error if the store or ledger cannot be read.
    pub fn collect(&self, keep_extra: &BTreeSet<ChainId>) -> StrataResult<CollectReport> {
        let volumes = self.volumes.volumes()?;
        let mut live = self.ledger.all_live_chain_ids()?;
        live.extend(keep_extra.iter().cloned());

        let kept = Self::kept_keys(&volumes, &live);
        let mut report = CollectReport::default();
        let mut failures = Vec::new();

        for key in Self::destroy_order(&volumes, &kept) {
            match self.volumes.destroy_volume(&key) {
                Ok(()) => {
                    tracing::debug!(key = %key, "Collected volume");
                    report.destroyed.push(key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to collect volume");
                    failures.push((key, e.to_string()));
                }
            }
        }

        report.kept = volumes
            .iter()
            .filter(|v| kept.contains(v.key.as_str()))
            .map(|v| v.key.clone())
            .collect();

        tracing::info!(
            destroyed = report.destroyed.len(),
            kept = report.kept.len(),
            failed = failures.len(),
            "Garbage collection finished"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(StrataError::Collection { failures })
        }
    }

    /// Live volumes plus every ancestor of a live volume.
    fn kept_keys<'a>(volumes: &'a [VolumeInfo], live: &BTreeSet<ChainId>) -> HashSet<&'a str> {
        let parents: HashMap<&str, &str> = volumes
            .iter()
            .filter_map(|v| v.parent.as_deref().map(|p| (v.key.as_str(), p)))
            .collect();
        let present: HashSet<&str> = volumes.iter().map(|v| v.key.as_str()).collect();

        let mut kept = HashSet::new();
        for volume in volumes {
            if !live.contains(&ChainId::from_volume_key(&volume.key)) {
                continue;
            }
            let mut key = Some(volume.key.as_str());
            while let Some(current) = key {
                if !present.contains(current) || !kept.insert(current) {
                    break;
                }
                key = parents.get(current).copied();
            }
        }

        kept
    }

    /// Dead volumes, deepest first so no parent goes before its children.
    fn destroy_order(volumes: &[VolumeInfo], kept: &HashSet<&str>) -> Vec<String> {
        let parents: HashMap<&str, &str> = volumes
            .iter()
            .filter_map(|v| v.parent.as_deref().map(|p| (v.key.as_str(), p)))
            .collect();

        let depth = |key: &str| {
            let mut depth = 0usize;
            let mut current = key;
            while let Some(parent) = parents.get(current) {
                depth += 1;
                if depth > volumes.len() {
                    break;
                }
                current = parent;
            }
            depth
        };

        let mut dead: Vec<(usize, &str)> = volumes
            .iter()
            .map(|v| v.key.as_str())
            .filter(|key| !kept.contains(key))
            .map(|key| (depth(key), key))
            .collect();
        dead.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        dead.into_iter().map(|(_, key)| key.to_string()).collect()
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn volume(key: &str, parent: Option<&str>) -> VolumeInfo {
        VolumeInfo {
            key: key.to_string(),
            parent: parent.map(str::to_string),
            path: PathBuf::from("/volumes").join(key),
        }
    }

    fn live(ids: &[&str]) -> BTreeSet<ChainId> {
        ids.iter().map(ChainId::new).collect()
    }

    #[test]
    fn children_are_destroyed_before_parents() {
        let volumes = [
            volume("a", None),
            volume("b", Some("a")),
            volume("c", Some("b")),
            volume("x", None),
        ];

        let order = GarbageCollector::destroy_order(&volumes, &HashSet::new());
        assert_eq!(order, ["c", "b", "a", "x"]);
    }

    #[test]
    fn namespaced_volumes_share_liveness_with_their_chain() {
        let volumes = [volume("a", None), volume("a-namespaced", None), volume("b", None)];

        let kept = GarbageCollector::kept_keys(&volumes, &live(&["a"]));
        assert!(kept.contains("a"));
        assert!(kept.contains("a-namespaced"));
        assert!(!kept.contains("b"));
    }

    #[test]
    fn ancestors_of_live_volumes_are_kept() {
        let volumes = [volume("a", None), volume("b", Some("a")), volume("c", Some("b"))];

        let kept = GarbageCollector::kept_keys(&volumes, &live(&["c"]));
        assert_eq!(kept.len(), 3);
    }

    /// A forest where volume `i` has parent `parents[i]`, always an earlier index.
    fn forest(parents: &[Option<usize>]) -> Vec<VolumeInfo> {
        parents
            .iter()
            .enumerate()
            .map(|(i, parent)| {
                let parent = parent.filter(|p| *p < i).map(|p| format!("v{p}"));
                volume(&format!("v{i}"), parent.as_deref())
            })
            .collect()
    }

    proptest! {
        #[test]
        fn children_always_precede_parents(
            parents in prop::collection::vec(prop::option::of(0usize..16), 1..16),
        ) {
            let volumes = forest(&parents);
            let order = GarbageCollector::destroy_order(&volumes, &HashSet::new());
            let position = |key: &str| order.iter().position(|k| k == key);

            prop_assert_eq!(order.len(), volumes.len());
            for v in &volumes {
                if let Some(parent) = &v.parent {
                    prop_assert!(position(&v.key) < position(parent));
                }
            }
        }

        #[test]
        fn kept_volumes_have_kept_ancestors(
            parents in prop::collection::vec(prop::option::of(0usize..16), 1..16),
            live_index in 0usize..16,
        ) {
            let volumes = forest(&parents);
            let key = format!("v{}", live_index % volumes.len());
            let kept = GarbageCollector::kept_keys(&volumes, &live(&[key.as_str()]));

            for v in &volumes {
                if kept.contains(v.key.as_str()) {
                    if let Some(parent) = &v.parent {
                        prop_assert!(kept.contains(parent.as_str()));
                    }
                }
            }
        }
    }
}
