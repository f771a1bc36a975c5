//! # strata-common
//!
//! Shared utilities and types for the Strata rootfs store.
//!
//! This crate provides common functionality used across all Strata crates:
//! - Bundle, chain and reference identifiers
//! - UID/GID namespace mappings
//! - Standard store paths
//! - Byte quantity parsing
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod mapping;
pub mod paths;
pub mod quantity;

pub use error::{StrataError, StrataResult};
pub use id::{BundleId, ChainId, Digest, ReferenceName};
pub use mapping::{IdMapping, IdMappings};
pub use paths::StorePaths;
pub use quantity::ByteQuantity;
