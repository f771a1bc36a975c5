//! # Strata
//!
//! Strata keeps the root filesystems of containers in a layered store.
//!
//! ## Features
//!
//! - **Layer caching**: every layer of a base image is unpacked once into a
//!   volume keyed by its chain id and shared by all images built on it
//! - **Dependency tracking**: images and bundles record the chain ids they
//!   use, anything else can be garbage collected
//! - **Quotas**: bundles can be limited to a disk quota, checked before any
//!   layer is fetched
//! - **Safe concurrency**: creates and cleans from separate processes are
//!   serialized by a store-wide file lock
//!
//! ## Usage
//!
//! ```no_run
//! use strata::{CreateSpec, Strata, StoreConfig};
//! use strata_common::BundleId;
//!
//! # fn example() -> strata_common::StrataResult<()> {
//! let config = StoreConfig::default().with_store("/var/lib/strata");
//! let store = Strata::init_store(&config)?;
//!
//! let id = BundleId::new("web-1")?;
//! let bundle = store.create(&CreateSpec::new("oci:///images/busybox:latest", id.clone()))?;
//! println!("rootfs at {}", bundle.rootfs.display());
//!
//! store.delete(&id)?;
//! store.clean(0)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod builder;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod filesystem;
pub mod gc;
pub mod ledger;
pub mod lock;
pub mod manager;
pub mod namespace;
pub mod size;
pub mod volume;

pub use builder::{BaseImage, LayerGraphBuilder, PullSpec};
pub use bundle::{Bundle, BundleMetadata, BundleStats, BundleStore};
pub use config::StoreConfig;
pub use gc::{CollectReport, GarbageCollector};
pub use ledger::{DependencyLedger, DependencyRecord, FileDependencyLedger};
pub use lock::{GLOBAL_LOCK_KEY, LockHandle, LockManager};
pub use manager::{CleanOutcome, CreateSpec, Strata};
pub use size::{StoreSizeEstimator, WalkDirSizeEstimator};
pub use volume::{DirectoryVolumeStore, VolumeInfo, VolumeStore};
