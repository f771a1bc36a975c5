//! Applying layer archives to volumes.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::{PermissionsExt, lchown};
use std::path::{Component, Path, PathBuf};

use strata_common::{IdMappings, StrataError, StrataResult};

use crate::source::BlobStream;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Counters collected while applying a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    /// Archive entries written to the target.
    pub entries: u64,
    /// Whiteouts applied against lower layers.
    pub whiteouts: u64,
}

/// Applies a layer byte stream to a volume as a filesystem delta.
pub trait Unpacker: Send + Sync {
    /// Apply `stream` on top of the content already in `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is not a valid layer archive or the
    /// target cannot be written.
    fn apply(
        &self,
        stream: BlobStream,
        target: &Path,
        mappings: &IdMappings,
    ) -> StrataResult<UnpackStats>;
}

/// Unpacks plain, gzip or zstd compressed tar layers with OCI whiteouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarUnpacker;

impl TarUnpacker {
    /// Create a tar unpacker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Detect compression from the magic bytes of the stream.
    fn decompress(stream: BlobStream) -> StrataResult<Box<dyn Read + Send>> {
        let mut reader = BufReader::new(stream);
        let head = reader.fill_buf()?;

        if head.starts_with(GZIP_MAGIC) {
            Ok(Box::new(flate2::read::GzDecoder::new(reader)))
        } else if head.starts_with(ZSTD_MAGIC) {
            Ok(Box::new(zstd::stream::read::Decoder::with_buffer(reader)?))
        } else {
            Ok(Box::new(reader))
        }
    }

    /// Whether ownership from the archive should be written to disk.
    fn chown_needed(mappings: &IdMappings) -> bool {
        mappings.is_namespaced() || rustix::process::geteuid().is_root()
    }

    fn apply_ownership(
        path: &Path,
        header: &tar::Header,
        mappings: &IdMappings,
    ) -> StrataResult<()> {
        let uid = mappings.map_uid(u32::try_from(header.uid()?).map_err(corrupt_ids)?)?;
        let gid = mappings.map_gid(u32::try_from(header.gid()?).map_err(corrupt_ids)?)?;

        lchown(path, Some(uid), Some(gid))?;

        // chown clears setuid/setgid, put the archived mode back.
        if header.entry_type() != tar::EntryType::Symlink {
            let mode = header.mode()?;
            if mode & 0o6000 != 0 {
                fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
            }
        }

        Ok(())
    }
}

impl Unpacker for TarUnpacker {
    fn apply(
        &self,
        stream: BlobStream,
        target: &Path,
        mappings: &IdMappings,
    ) -> StrataResult<UnpackStats> {
        let root = fs::canonicalize(target)?;
        let mut archive = tar::Archive::new(Self::decompress(stream)?);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);

        let chown = Self::chown_needed(mappings);
        let mut stats = UnpackStats::default();
        let mut created: HashSet<PathBuf> = HashSet::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.into_owned();
            let dest = safe_join(&root, &rel).ok_or_else(|| escapes(&rel))?;

            // The archive root itself, usually "./".
            if dest == root {
                continue;
            }

            let name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = dest.parent().unwrap_or(&root).to_path_buf();

            if name == OPAQUE_MARKER {
                if let Some(dir) = resolve_within(&root, &parent, &rel)? {
                    clear_lower(&dir, &created)?;
                }
                stats.whiteouts += 1;
                continue;
            }

            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                if hidden.is_empty() || hidden == "." || hidden == ".." {
                    return Err(StrataError::Internal {
                        message: format!("invalid whiteout {}", rel.display()),
                    });
                }
                if let Some(dir) = resolve_within(&root, &parent, &rel)? {
                    let victim = dir.join(hidden);
                    if !created.contains(&victim) {
                        remove_path(&victim)?;
                    }
                }
                stats.whiteouts += 1;
                continue;
            }

            // A non-directory replacing a directory from a lower layer.
            if entry.header().entry_type() != tar::EntryType::Directory {
                if let Some(dir) = resolve_within(&root, &parent, &rel)? {
                    let existing = dir.join(&name);
                    if fs::symlink_metadata(&existing).is_ok_and(|m| m.is_dir()) {
                        fs::remove_dir_all(&existing)?;
                    }
                }
            }

            if !entry.unpack_in(&root)? {
                return Err(escapes(&rel));
            }

            if chown {
                Self::apply_ownership(&dest, entry.header(), mappings)?;
            }

            created.insert(dest);
            stats.entries += 1;
        }

        tracing::debug!(
            target = %target.display(),
            entries = stats.entries,
            whiteouts = stats.whiteouts,
            "Layer applied"
        );

        Ok(stats)
    }
}

fn corrupt_ids(e: std::num::TryFromIntError) -> StrataError {
    StrataError::Internal {
        message: format!("archive owner id out of range: {e}"),
    }
}

fn escapes(rel: &Path) -> StrataError {
    StrataError::Internal {
        message: format!("archive entry {} escapes the volume", rel.display()),
    }
}

/// Resolve `dir` through any symlinks a lower layer left in it.
///
/// Returns `None` if `dir` does not exist, and an error if it resolves
/// outside `root`. `root` must already be canonical.
fn resolve_within(root: &Path, dir: &Path, rel: &Path) -> StrataResult<Option<PathBuf>> {
    match fs::canonicalize(dir) {
        Ok(real) if real.starts_with(root) => Ok(Some(real)),
        Ok(_) => Err(escapes(rel)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Join an archive path onto `root`, refusing anything that climbs out.
fn safe_join(root: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove everything under `dir` that came from lower layers.
fn clear_lower(dir: &Path, created: &HashSet<PathBuf>) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        if !created.contains(&path) {
            remove_path(&path)?;
        } else if fs::symlink_metadata(&path)?.is_dir() {
            clear_lower(&path, created)?;
        }
    }

    Ok(())
}
