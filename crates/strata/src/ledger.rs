//! Dependency ledger.
//!
//! Records, per image or bundle, which chain ids it keeps alive. Each
//! reference name has its own record file so registering one name never
//! rewrites another.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::{ChainId, ReferenceName, StrataError, StrataResult};
use tempfile::NamedTempFile;

const RECORD_EXTENSION: &str = "json";

/// The chain ids pinned by one reference name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// The reference name.
    pub name: ReferenceName,
    /// Pinned chain ids, root first.
    pub chain_ids: Vec<ChainId>,
    /// When the record was written.
    pub registered_at: DateTime<Utc>,
}

/// Durable mapping from reference names to the chain ids they pin.
pub trait DependencyLedger: Send + Sync {
    /// Record that `name` depends on `chain_ids`, replacing any earlier record.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::DependencyRegistration`] if the record cannot be
    /// written.
    fn register(&self, name: &ReferenceName, chain_ids: &[ChainId]) -> StrataResult<()>;

    /// Drop the record of `name`. Unknown names are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be removed.
    fn deregister(&self, name: &ReferenceName) -> StrataResult<()>;

    /// The record of `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    fn dependencies(&self, name: &ReferenceName) -> StrataResult<Option<DependencyRecord>>;

    /// Union of the chain ids of every record.
    ///
    /// # Errors
    ///
    /// Returns an error if any record cannot be read, so that an unreadable
    /// record never makes its volumes look dead.
    fn all_live_chain_ids(&self) -> StrataResult<BTreeSet<ChainId>>;
}

/// Ledger keeping one JSON file per reference name.
#[derive(Debug, Clone)]
pub struct FileDependencyLedger {
    dir: PathBuf,
}

impl FileDependencyLedger {
    /// Create a ledger stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the record file for `name`.
    #[must_use]
    pub fn record_path(&self, name: &ReferenceName) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", name.encode()))
    }

    /// Every record in the ledger, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a record cannot be read.
    pub fn records(&self) -> StrataResult<Vec<DependencyRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(record) = Self::read_record(&path)? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn read_record(path: &Path) -> StrataResult<Option<DependencyRecord>> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content).map(Some).map_err(|e| {
            StrataError::Serialization(format!(
                "corrupt dependency record {}: {e}",
                path.display()
            ))
        })
    }

    fn write_record(&self, record: &DependencyRecord) -> StrataResult<()> {
        fs::create_dir_all(&self.dir)?;

        let mut file = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut file, record)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(self.record_path(&record.name))
            .map_err(|e| e.error)?;

        Ok(())
    }
}

impl DependencyLedger for FileDependencyLedger {
    fn register(&self, name: &ReferenceName, chain_ids: &[ChainId]) -> StrataResult<()> {
        let record = DependencyRecord {
            name: name.clone(),
            chain_ids: chain_ids.to_vec(),
            registered_at: Utc::now(),
        };

        self.write_record(&record)
            .map_err(|e| StrataError::DependencyRegistration {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        tracing::debug!(name = %name, chain_ids = chain_ids.len(), "Dependencies registered");
        Ok(())
    }

    fn deregister(&self, name: &ReferenceName) -> StrataResult<()> {
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => {
                tracing::debug!(name = %name, "Dependencies deregistered");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn dependencies(&self, name: &ReferenceName) -> StrataResult<Option<DependencyRecord>> {
        Self::read_record(&self.record_path(name))
    }

    fn all_live_chain_ids(&self) -> StrataResult<BTreeSet<ChainId>> {
        Ok(self
            .records()?
            .into_iter()
            .flat_map(|r| r.chain_ids)
            .collect())
    }
}
