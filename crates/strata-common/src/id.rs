//! Bundle, chain and reference identifiers.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// Suffix appended to volume keys built under non-identity id mappings.
pub const NAMESPACED_SUFFIX: &str = "-namespaced";

/// A validated bundle ID.
///
/// Bundle IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// Maximum length of a bundle ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new bundle ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> StrataResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random bundle ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the bundle ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> StrataResult<()> {
        let invalid = || StrataError::InvalidBundleId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BundleId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for BundleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Content id of a layer together with its whole ancestry.
///
/// Stored without the algorithm prefix so it can double as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    /// Wrap a chain id, dropping a leading `sha256:` if present.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref();
        Self(id.strip_prefix("sha256:").unwrap_or(id).to_string())
    }

    /// Get the chain id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key of the volume holding this layer.
    ///
    /// Volumes built under non-identity id mappings get their own key since
    /// file ownership inside them differs.
    #[must_use]
    pub fn volume_key(&self, namespaced: bool) -> String {
        if namespaced {
            format!("{}{NAMESPACED_SUFFIX}", self.0)
        } else {
            self.0.clone()
        }
    }

    /// Recover the chain id a volume key was derived from.
    #[must_use]
    pub fn from_volume_key(key: &str) -> Self {
        Self(key.strip_suffix(NAMESPACED_SUFFIX).unwrap_or(key).to_string())
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content-addressable digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Create a SHA-256 digest.
    #[must_use]
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new("sha256", hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hash))
                if !algorithm.is_empty()
                    && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
                    && !hash.is_empty()
                    && hash.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Self::new(algorithm, hash))
            }
            _ => Err(StrataError::Serialization(format!("invalid digest: {s}"))),
        }
    }
}

/// Name under which a set of chain ids is kept alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceName {
    /// A base image, keyed by its source reference.
    Image(String),
    /// A bundle created from an image.
    Bundle(BundleId),
}

impl ReferenceName {
    const IMAGE_PREFIX: &'static str = "image:";
    const BUNDLE_PREFIX: &'static str = "bundle:";

    /// Name for an image source.
    #[must_use]
    pub fn image(source: impl Into<String>) -> Self {
        Self::Image(source.into())
    }

    /// Name for a bundle.
    #[must_use]
    pub fn bundle(id: &BundleId) -> Self {
        Self::Bundle(id.clone())
    }

    /// Filesystem-safe, reversible encoding of the name.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Image(source) => format!("image-{}", URL_SAFE_NO_PAD.encode(source)),
            Self::Bundle(id) => format!("bundle-{id}"),
        }
    }

    /// Reverse of [`ReferenceName::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the string was not produced by `encode`.
    pub fn decode(encoded: &str) -> StrataResult<Self> {
        let invalid = || StrataError::Serialization(format!("invalid reference file: {encoded}"));

        if let Some(rest) = encoded.strip_prefix("image-") {
            let bytes = URL_SAFE_NO_PAD.decode(rest).map_err(|_| invalid())?;
            let source = String::from_utf8(bytes).map_err(|_| invalid())?;
            Ok(Self::Image(source))
        } else if let Some(rest) = encoded.strip_prefix("bundle-") {
            Ok(Self::Bundle(BundleId::new(rest).map_err(|_| invalid())?))
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for ReferenceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(source) => write!(f, "{}{source}", Self::IMAGE_PREFIX),
            Self::Bundle(id) => write!(f, "{}{id}", Self::BUNDLE_PREFIX),
        }
    }
}

impl FromStr for ReferenceName {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(source) = s.strip_prefix(Self::IMAGE_PREFIX) {
            Ok(Self::Image(source.to_string()))
        } else if let Some(id) = s.strip_prefix(Self::BUNDLE_PREFIX) {
            Ok(Self::Bundle(BundleId::new(id)?))
        } else {
            Err(StrataError::Serialization(format!("invalid reference name: {s}")))
        }
    }
}

impl Serialize for ReferenceName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReferenceName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
