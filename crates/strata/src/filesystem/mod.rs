//! Filesystem helpers shared by volumes and bundles.
//!
//! This module handles:
//! - Copying a rootfs tree with its metadata
//! - Removing trees that contain read-only directories

mod tree;

pub use tree::{copy_tree, remove_tree};
