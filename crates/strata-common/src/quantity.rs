//! Byte quantity parsing and representation.
//!
//! Disk limits and clean thresholds accept:
//! - Binary suffixes: "128Ki", "512Mi", "1Gi", "2Ti"
//! - Decimal suffixes: "128k", "512M", "1G", "2T"
//! - Plain numbers as bytes: "1048576"

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

const KI: u64 = 1024;
const MI: u64 = 1024 * KI;
const GI: u64 = 1024 * MI;
const TI: u64 = 1024 * GI;

/// An amount of disk space in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteQuantity(u64);

impl ByteQuantity {
    /// Create a quantity from bytes.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a quantity from mebibytes (MiB).
    #[must_use]
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * MI)
    }

    /// Create a quantity from gibibytes (GiB).
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * GI)
    }

    /// Get the raw number of bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Parse a byte quantity string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid quantity or overflows.
    pub fn parse(s: &str) -> StrataResult<Self> {
        let s = s.trim();
        let invalid = || StrataError::InvalidResourceQuantity {
            value: s.to_string(),
        };

        // Binary suffixes must be tried first so "Mi" is not read as "M".
        let suffixes = [
            ("Ki", KI),
            ("Mi", MI),
            ("Gi", GI),
            ("Ti", TI),
            ("k", 1000u64),
            ("K", 1000),
            ("M", 1000 * 1000),
            ("G", 1000 * 1000 * 1000),
            ("T", 1000 * 1000 * 1000 * 1000),
        ];

        for (suffix, multiplier) in suffixes {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 = stripped.trim().parse().map_err(|_| invalid())?;
                return value.checked_mul(multiplier).map(Self).ok_or_else(invalid);
            }
        }

        s.parse().map(Self).map_err(|_| invalid())
    }
}

impl fmt::Display for ByteQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        if v >= TI && v % TI == 0 {
            write!(f, "{}Ti", v / TI)
        } else if v >= GI && v % GI == 0 {
            write!(f, "{}Gi", v / GI)
        } else if v >= MI && v % MI == 0 {
            write!(f, "{}Mi", v / MI)
        } else if v >= KI && v % KI == 0 {
            write!(f, "{}Ki", v / KI)
        } else {
            write!(f, "{v}")
        }
    }
}

impl FromStr for ByteQuantity {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ByteQuantity> for u64 {
    fn from(q: ByteQuantity) -> Self {
        q.0
    }
}
