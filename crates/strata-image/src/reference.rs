//! Base image reference parsing.

use std::path::PathBuf;
use std::str::FromStr;

use strata_common::{StrataError, StrataResult};

/// A parsed base image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// The reference exactly as the caller wrote it.
    pub reference: String,
    /// Where the layers come from.
    pub kind: SourceKind,
}

/// Kind of base image source, selected by the reference scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// A single rootfs tarball on the local filesystem.
    LocalTar {
        /// Path to the tarball.
        path: PathBuf,
    },
    /// An OCI image layout directory.
    OciLayout {
        /// Layout directory (holding `index.json`).
        path: PathBuf,
        /// Tag to select from the index.
        tag: Option<String>,
    },
    /// An image in a remote registry.
    Registry {
        /// Reference without the scheme.
        name: String,
    },
}

impl ImageSource {
    /// Scheme of OCI image layouts.
    pub const OCI_SCHEME: &'static str = "oci://";
    /// Scheme of remote registry images.
    pub const DOCKER_SCHEME: &'static str = "docker://";
    /// Scheme of local tarballs.
    pub const FILE_SCHEME: &'static str = "file://";

    /// Parse a base image reference.
    ///
    /// Examples:
    /// - `/images/rootfs.tar` -> local tarball
    /// - `file:///images/rootfs.tar` -> local tarball
    /// - `oci:///images/busybox` -> OCI layout, single manifest
    /// - `oci:///images/busybox:1.36` -> OCI layout, manifest tagged `1.36`
    /// - `docker:///library/alpine:3.19` -> remote registry
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is empty or uses an unknown scheme.
    pub fn parse(reference: &str) -> StrataResult<Self> {
        let trimmed = reference.trim();
        let invalid = |message: &str| StrataError::SourceResolution {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("empty image reference"));
        }

        let kind = if let Some(rest) = trimmed.strip_prefix(Self::OCI_SCHEME) {
            let (path, tag) = split_tag(rest);
            if path.is_empty() {
                return Err(invalid("missing OCI layout path"));
            }
            SourceKind::OciLayout {
                path: PathBuf::from(path),
                tag,
            }
        } else if let Some(rest) = trimmed.strip_prefix(Self::DOCKER_SCHEME) {
            SourceKind::Registry {
                name: rest.trim_start_matches('/').to_string(),
            }
        } else if let Some(rest) = trimmed.strip_prefix(Self::FILE_SCHEME) {
            SourceKind::LocalTar {
                path: PathBuf::from(rest),
            }
        } else if trimmed.contains("://") {
            return Err(invalid("unsupported scheme"));
        } else {
            SourceKind::LocalTar {
                path: PathBuf::from(trimmed),
            }
        };

        Ok(Self {
            reference: trimmed.to_string(),
            kind,
        })
    }

    /// Whether layers are read from the local filesystem.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        !matches!(self.kind, SourceKind::Registry { .. })
    }
}

/// Split `path[:tag]`, where a tag never contains a slash.
fn split_tag(rest: &str) -> (&str, Option<String>) {
    match rest.rfind(':') {
        Some(idx) if !rest[idx + 1..].contains('/') && idx + 1 < rest.len() => {
            (&rest[..idx], Some(rest[idx + 1..].to_string()))
        }
        _ => (rest, None),
    }
}

impl FromStr for ImageSource {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}
