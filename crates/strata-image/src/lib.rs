//! # strata-image
//!
//! Base image handling for Strata.
//!
//! This crate provides:
//! - Parsing of image source references
//! - Layer sources for local tarballs and OCI image layouts
//! - Chain id derivation for layer stacks
//! - Applying layer archives to volumes

#![warn(missing_docs)]

pub mod descriptor;
pub mod local;
pub mod oci;
pub mod reference;
pub mod source;
pub mod unpack;

pub use descriptor::{ImageConfig, LayerDescriptor};
pub use reference::{ImageSource, SourceKind};
pub use source::{BlobStream, LayerSource, ResolvedImage, SourceSelector};
pub use unpack::{TarUnpacker, UnpackStats, Unpacker};
