//! Store size estimation.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};
use walkdir::WalkDir;

/// Reports how many bytes the store occupies.
pub trait StoreSizeEstimator: Send + Sync {
    /// Bytes currently used by the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be measured.
    fn measure_store(&self) -> StrataResult<u64>;
}

/// Sums file sizes under the store root.
#[derive(Debug, Clone)]
pub struct WalkDirSizeEstimator {
    root: PathBuf,
}

impl WalkDirSizeEstimator {
    /// Measure the tree at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreSizeEstimator for WalkDirSizeEstimator {
    fn measure_store(&self) -> StrataResult<u64> {
        let bytes = disk_usage(&self.root)?;
        tracing::debug!(root = %self.root.display(), bytes, "Measured store");
        Ok(bytes)
    }
}

/// Total size of the regular files under `path`.
///
/// Hard-linked files count once. A missing path is empty.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked.
pub fn disk_usage(path: &Path) -> StrataResult<u64> {
    let mut total = 0u64;
    let mut seen = HashSet::new();

    if !path.exists() {
        return Ok(0);
    }

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // Removed while walking.
            Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
                continue;
            }
            Err(e) => {
                return Err(StrataError::Internal {
                    message: format!("Failed to walk directory: {e}"),
                });
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        if metadata.nlink() > 1 && !seen.insert((metadata.dev(), metadata.ino())) {
            continue;
        }

        total = total.saturating_add(metadata.len());
    }

    Ok(total)
}
