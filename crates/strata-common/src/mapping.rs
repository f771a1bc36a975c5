//! UID/GID namespace mappings.
//!
//! Layers unpacked under a non-identity mapping have their file ownership
//! shifted into the host range, so volumes built that way are kept apart
//! from volumes built without one.

use std::fmt;
use std::fs;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// UID/GID mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First id inside the namespace.
    pub namespace_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Range size.
    pub size: u32,
}

impl IdMapping {
    /// Create a new ID mapping.
    #[must_use]
    pub const fn new(namespace_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            namespace_id,
            host_id,
            size,
        }
    }

    /// Whether the mapping leaves ids unchanged.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.namespace_id == self.host_id
    }

    /// Host id for `id`, if it falls inside this range.
    #[must_use]
    pub fn map(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.namespace_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.host_id, self.size)
    }
}

impl FromStr for IdMapping {
    type Err = StrataError;

    /// Parse `namespace_id:host_id:size`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StrataError::InvalidIdMapping {
            value: s.to_string(),
        };

        let parts: Vec<&str> = s.trim().split(':').collect();
        let [ns, host, size] = parts.as_slice() else {
            return Err(invalid());
        };

        let mapping = Self::new(
            ns.parse().map_err(|_| invalid())?,
            host.parse().map_err(|_| invalid())?,
            size.parse().map_err(|_| invalid())?,
        );

        if mapping.size == 0 {
            return Err(invalid());
        }

        Ok(mapping)
    }
}

/// UID and GID mappings used for a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    /// UID mappings.
    #[serde(default)]
    pub uid: Vec<IdMapping>,
    /// GID mappings.
    #[serde(default)]
    pub gid: Vec<IdMapping>,
}

impl IdMappings {
    /// Create mappings from UID and GID ranges.
    #[must_use]
    pub const fn new(uid: Vec<IdMapping>, gid: Vec<IdMapping>) -> Self {
        Self { uid, gid }
    }

    /// Whether any mapping shifts ids.
    #[must_use]
    pub fn is_namespaced(&self) -> bool {
        self.uid.iter().chain(&self.gid).any(|m| !m.is_identity())
    }

    /// Map a UID from an archive to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if no range covers the id.
    pub fn map_uid(&self, uid: u32) -> StrataResult<u32> {
        Self::map_with(&self.uid, uid, "uid")
    }

    /// Map a GID from an archive to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if no range covers the id.
    pub fn map_gid(&self, gid: u32) -> StrataResult<u32> {
        Self::map_with(&self.gid, gid, "gid")
    }

    fn map_with(mappings: &[IdMapping], id: u32, kind: &str) -> StrataResult<u32> {
        if mappings.is_empty() {
            return Ok(id);
        }

        mappings
            .iter()
            .find_map(|m| m.map(id))
            .ok_or_else(|| StrataError::InvalidIdMapping {
                value: format!("{kind} {id} is not covered by any mapping"),
            })
    }

    /// Mappings for the current unprivileged user.
    ///
    /// Root inside the namespace maps to the caller, and the rest of the
    /// range comes from `/etc/subuid` and `/etc/subgid`.
    #[must_use]
    pub fn rootless() -> Self {
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        let username = Self::username(uid);

        let mut uid_mappings = vec![IdMapping::new(0, uid, 1)];
        let mut gid_mappings = vec![IdMapping::new(0, gid, 1)];

        if let Some((start, count)) = Self::read_subid("/etc/subuid", uid, &username) {
            uid_mappings.push(IdMapping::new(1, start, count));
        }

        if let Some((start, count)) = Self::read_subid("/etc/subgid", uid, &username) {
            gid_mappings.push(IdMapping::new(1, start, count));
        }

        Self::new(uid_mappings, gid_mappings)
    }

    fn read_subid(path: &str, id: u32, username: &str) -> Option<(u32, u32)> {
        let content = fs::read_to_string(path).ok()?;
        parse_subid(&content, id, username)
    }

    fn username(uid: u32) -> String {
        let content = fs::read_to_string("/etc/passwd").unwrap_or_default();

        content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split(':').collect();
                (parts.len() >= 3 && parts[2].parse::<u32>().ok() == Some(uid))
                    .then(|| parts[0].to_string())
            })
            .next()
            .unwrap_or_else(|| uid.to_string())
    }
}

/// Find the subordinate range for a user in `/etc/subuid` syntax.
fn parse_subid(content: &str, id: u32, username: &str) -> Option<(u32, u32)> {
    let id_str = id.to_string();

    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 || (parts[0] != id_str && parts[0] != username) {
            return None;
        }
        Some((parts[1].parse().ok()?, parts[2].parse().ok()?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mapping() {
        let m: IdMapping = "0:100000:65536".parse().unwrap();
        assert_eq!(m, IdMapping::new(0, 100_000, 65536));
        assert_eq!(m.to_string(), "0:100000:65536");

        assert!("0:1".parse::<IdMapping>().is_err());
        assert!("0:1:0".parse::<IdMapping>().is_err());
        assert!("a:b:c".parse::<IdMapping>().is_err());
    }

    #[test]
    fn identity_is_not_namespaced() {
        assert!(!IdMappings::default().is_namespaced());

        let identity = IdMappings::new(vec![IdMapping::new(0, 0, 1)], vec![IdMapping::new(0, 0, 1)]);
        assert!(!identity.is_namespaced());

        let shifted = IdMappings::new(vec![IdMapping::new(0, 1000, 1)], vec![]);
        assert!(shifted.is_namespaced());
    }

    #[test]
    fn maps_ids_into_host_range() {
        let mappings = IdMappings::new(
            vec![IdMapping::new(0, 1000, 1), IdMapping::new(1, 100_000, 65536)],
            vec![IdMapping::new(0, 1000, 1)],
        );
        assert_eq!(mappings.map_uid(0).unwrap(), 1000);
        assert_eq!(mappings.map_uid(1).unwrap(), 100_000);
        assert_eq!(mappings.map_uid(33).unwrap(), 100_032);
        assert!(mappings.map_gid(5).is_err());
    }

    #[test]
    fn empty_mappings_leave_ids_alone() {
        assert_eq!(IdMappings::default().map_uid(42).unwrap(), 42);
    }

    #[test]
    fn subid_lookup() {
        let content = "alice:100000:65536\n1001:200000:1000\n";
        assert_eq!(parse_subid(content, 1000, "alice"), Some((100_000, 65536)));
        assert_eq!(parse_subid(content, 1001, "bob"), Some((200_000, 1000)));
        assert_eq!(parse_subid(content, 1002, "carol"), None);
    }
}
