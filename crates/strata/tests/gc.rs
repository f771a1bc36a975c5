//! Garbage collection and threshold cleaning.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{CheckingUnpacker, RecordingVolumeStore, ScriptedLayerSource};
use strata::{
    CleanOutcome, DependencyLedger, FileDependencyLedger, GarbageCollector, Strata, StoreConfig,
    StoreSizeEstimator,
};
use strata_common::{BundleId, ChainId, ReferenceName, StrataError, StrataResult};

fn chains(ids: &[&str]) -> Vec<ChainId> {
    ids.iter().map(ChainId::new).collect()
}

fn bundle(id: &str) -> ReferenceName {
    ReferenceName::bundle(&BundleId::new(id).unwrap())
}

/// `a <- b` and `a <- c`, the two stacks sharing their root.
fn shared_root() -> RecordingVolumeStore {
    RecordingVolumeStore::new()
        .with_volume("a", None)
        .with_volume("b", Some("a"))
        .with_volume("c", Some("a"))
}

struct FixedSize(u64);

impl StoreSizeEstimator for FixedSize {
    fn measure_store(&self) -> StrataResult<u64> {
        Ok(self.0)
    }
}

#[test_log::test]
fn released_layers_are_collected_once_unreferenced() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let ledger = Arc::new(FileDependencyLedger::new(temp.path()));
    let gc = GarbageCollector::new(volumes.clone(), ledger.clone());

    ledger.register(&bundle("b1"), &chains(&["a", "b"])).unwrap();
    ledger.register(&bundle("b2"), &chains(&["a", "c"])).unwrap();

    let report = gc.collect(&BTreeSet::new()).unwrap();
    assert!(report.destroyed.is_empty());
    assert_eq!(report.kept, ["a", "b", "c"]);

    ledger.deregister(&bundle("b1")).unwrap();
    let report = gc.collect(&BTreeSet::new()).unwrap();
    assert_eq!(report.destroyed, ["b"]);
    assert_eq!(volumes.keys(), BTreeSet::from(["a".to_string(), "c".to_string()]));

    ledger.deregister(&bundle("b2")).unwrap();
    let report = gc.collect(&BTreeSet::new()).unwrap();
    assert_eq!(report.destroyed, ["c", "a"]);
    assert!(volumes.keys().is_empty());
}

#[test]
fn image_records_keep_base_layers() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let ledger = Arc::new(FileDependencyLedger::new(temp.path()));

    ledger
        .register(&ReferenceName::image("oci:///images/x"), &chains(&["a", "b"]))
        .unwrap();

    let report = GarbageCollector::new(volumes.clone(), ledger)
        .collect(&BTreeSet::new())
        .unwrap();

    assert_eq!(report.destroyed, ["c"]);
    assert_eq!(report.kept, ["a", "b"]);
}

#[test]
fn keep_extra_protects_unregistered_layers() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let ledger = Arc::new(FileDependencyLedger::new(temp.path()));

    let keep = chains(&["c"]).into_iter().collect();
    let report = GarbageCollector::new(volumes.clone(), ledger)
        .collect(&keep)
        .unwrap();

    assert_eq!(report.destroyed, ["b"]);
    assert_eq!(volumes.keys(), BTreeSet::from(["a".to_string(), "c".to_string()]));
}

#[test]
fn namespaced_volumes_live_by_chain_id() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(
        RecordingVolumeStore::new()
            .with_volume("a", None)
            .with_volume("a-namespaced", None)
            .with_volume("z-namespaced", None),
    );
    let ledger = Arc::new(FileDependencyLedger::new(temp.path()));
    ledger.register(&bundle("b1"), &chains(&["a"])).unwrap();

    let report = GarbageCollector::new(volumes, ledger)
        .collect(&BTreeSet::new())
        .unwrap();

    assert_eq!(report.destroyed, ["z-namespaced"]);
    assert_eq!(report.kept, ["a", "a-namespaced"]);
}

#[test]
fn failures_are_accumulated() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(
        RecordingVolumeStore::new()
            .with_volume("x", None)
            .with_volume("y", None)
            .with_volume("z", None),
    );
    volumes.fail_destroy("x");
    volumes.fail_destroy("z");
    let ledger = Arc::new(FileDependencyLedger::new(temp.path()));

    let err = GarbageCollector::new(volumes.clone(), ledger)
        .collect(&BTreeSet::new())
        .unwrap_err();

    match err {
        StrataError::Collection { failures } => {
            let keys: Vec<&str> = failures.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, ["x", "z"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    // The pass kept going past the first failure.
    assert_eq!(volumes.destroyed(), ["y"]);
}

#[test]
fn corrupt_record_aborts_collection() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let ledger = Arc::new(FileDependencyLedger::new(temp.path()));
    ledger.register(&bundle("b1"), &chains(&["a", "b"])).unwrap();
    std::fs::write(ledger.record_path(&bundle("b1")), b"{ not json").unwrap();

    assert!(
        GarbageCollector::new(volumes.clone(), ledger)
            .collect(&BTreeSet::new())
            .is_err()
    );
    assert!(volumes.destroyed().is_empty());
}

fn store(temp: &tempfile::TempDir, volumes: Arc<RecordingVolumeStore>, used: u64) -> Strata {
    let config = StoreConfig::default().with_store(temp.path().join("store"));
    Strata::init_store(&config)
        .unwrap()
        .with_volume_store(volumes)
        .with_layer_source(Arc::new(ScriptedLayerSource::new()))
        .with_unpacker(Arc::new(CheckingUnpacker::new()))
        .with_size_estimator(Arc::new(FixedSize(used)))
}

#[test]
fn clean_below_threshold_is_a_no_op() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let strata = store(&temp, volumes.clone(), 1000);

    let outcome = strata.clean(1000).unwrap();

    assert_eq!(outcome, CleanOutcome::Skipped { bytes_used: 1000 });
    assert_eq!(volumes.keys().len(), 3);
}

#[test]
fn clean_above_threshold_collects() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let strata = store(&temp, volumes.clone(), 1001);

    match strata.clean(1000).unwrap() {
        CleanOutcome::Collected(report) => assert_eq!(report.destroyed, ["b", "c", "a"]),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(volumes.keys().is_empty());
}

#[test]
fn zero_threshold_always_collects() {
    let temp = tempfile::tempdir().unwrap();
    let volumes = Arc::new(shared_root());
    let strata = store(&temp, volumes.clone(), 0);

    assert!(matches!(
        strata.clean(0).unwrap(),
        CleanOutcome::Collected(_)
    ));
    assert!(volumes.keys().is_empty());
}
