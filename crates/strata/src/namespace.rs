//! The id mappings a store was initialized with.
//!
//! Every volume in a store is built under the same mappings, recorded once
//! when the store is initialized.

use std::fs;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::{IdMappings, StorePaths, StrataError, StrataResult};

/// Persisted namespace settings of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// UID/GID mappings in force.
    pub mappings: IdMappings,
    /// When the store was initialized.
    pub created_at: DateTime<Utc>,
}

impl NamespaceRecord {
    /// Create a record for `mappings`.
    #[must_use]
    pub fn new(mappings: IdMappings) -> Self {
        Self {
            mappings,
            created_at: Utc::now(),
        }
    }

    /// Load the record of the store at `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::StoreNotInitialized`] if the store has no record.
    pub fn load(paths: &StorePaths) -> StrataResult<Self> {
        match fs::read(paths.namespace_file()) {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StrataError::StoreNotInitialized {
                store: paths.root.display().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the record for a fresh store, or check it against an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NamespaceMismatch`] if the store was initialized
    /// with different mappings.
    pub fn ensure(paths: &StorePaths, mappings: &IdMappings) -> StrataResult<Self> {
        match Self::load(paths) {
            Ok(existing) if existing.mappings == *mappings => Ok(existing),
            Ok(_) => Err(StrataError::NamespaceMismatch {
                store: paths.root.display().to_string(),
            }),
            Err(StrataError::StoreNotInitialized { .. }) => {
                let record = Self::new(mappings.clone());
                fs::write(paths.namespace_file(), serde_json::to_vec_pretty(&record)?)?;
                tracing::debug!(
                    store = %paths.root.display(),
                    namespaced = mappings.is_namespaced(),
                    "Namespace recorded"
                );
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }
}
