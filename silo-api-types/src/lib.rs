//! Wire-visible basic types of the silo repository core.
//!
//! Everything in here is either persisted verbatim (resource type tags,
//! version numbers) or part of user-facing reporting (maintenance
//! counters), so changes are format changes.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

mod crypto;
pub use crypto::{CryptMode, Fingerprint};

mod maintenance;
pub use maintenance::MaintenanceStatus;

/// The 32-byte address of every blob and container.
///
/// A keyed MAC when the repository is encrypted, a plain SHA-256
/// otherwise. Rendered as 64 hex characters on backends and in logs.
pub type Mac = [u8; 32];

pub const MAC_SIZE: usize = 32;

/// Tag identifying what a persisted byte range contains.
///
/// Containers (`Config`, `Lock`, `State`, `Packfile`) are stored directly
/// by a backend; everything else is a blob living inside a packfile.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Config,
    Lock,
    State,
    Packfile,
    Snapshot,
    Signature,
    Object,
    Chunk,
}

impl ResourceType {
    /// Stable on-disk tag. Append-only, never renumber.
    pub fn as_u32(self) -> u32 {
        match self {
            ResourceType::Config => 1,
            ResourceType::Lock => 2,
            ResourceType::State => 3,
            ResourceType::Packfile => 4,
            ResourceType::Snapshot => 5,
            ResourceType::Signature => 6,
            ResourceType::Object => 7,
            ResourceType::Chunk => 8,
        }
    }

    pub fn from_u32(tag: u32) -> Result<Self, Error> {
        Ok(match tag {
            1 => ResourceType::Config,
            2 => ResourceType::Lock,
            3 => ResourceType::State,
            4 => ResourceType::Packfile,
            5 => ResourceType::Snapshot,
            6 => ResourceType::Signature,
            7 => ResourceType::Object,
            8 => ResourceType::Chunk,
            other => bail!("unknown resource type tag {}", other),
        })
    }

    /// Containers are stored directly by a backend, blobs inside packfiles.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            ResourceType::Config
                | ResourceType::Lock
                | ResourceType::State
                | ResourceType::Packfile
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Config => "config",
            ResourceType::Lock => "lock",
            ResourceType::State => "state",
            ResourceType::Packfile => "packfile",
            ResourceType::Snapshot => "snapshot",
            ResourceType::Signature => "signature",
            ResourceType::Object => "object",
            ResourceType::Chunk => "chunk",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 24-bit `major.minor.patch` carried by every persisted resource.
///
/// Readers accept anything with a known major; a bumped major means the
/// layout changed incompatibly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl ResourceVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn as_u32(self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | (self.patch as u32)
    }

    pub fn from_u32(raw: u32) -> Result<Self, Error> {
        if raw > 0x00ff_ffff {
            bail!("resource version {:#x} does not fit 24 bits", raw);
        }
        Ok(Self {
            major: (raw >> 16) as u8,
            minor: (raw >> 8) as u8,
            patch: raw as u8,
        })
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Current writer version for every resource type.
///
/// Initialization-time constant; the table is the single place a version
/// bump happens.
pub fn current_version(ty: ResourceType) -> ResourceVersion {
    match ty {
        ResourceType::Config => ResourceVersion::new(1, 0, 0),
        ResourceType::Lock => ResourceVersion::new(1, 0, 0),
        ResourceType::State => ResourceVersion::new(1, 0, 0),
        ResourceType::Packfile => ResourceVersion::new(1, 0, 0),
        ResourceType::Snapshot => ResourceVersion::new(1, 0, 0),
        ResourceType::Signature => ResourceVersion::new(1, 0, 0),
        ResourceType::Object => ResourceVersion::new(1, 0, 0),
        ResourceType::Chunk => ResourceVersion::new(1, 0, 0),
    }
}

/// Check whether a persisted version can be read by this build.
pub fn version_supported(ty: ResourceType, version: ResourceVersion) -> bool {
    version.major == current_version(ty).major
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resource_type_tags_roundtrip() {
        for tag in 1..=8 {
            let ty = ResourceType::from_u32(tag).unwrap();
            assert_eq!(ty.as_u32(), tag);
        }
        assert!(ResourceType::from_u32(0).is_err());
        assert!(ResourceType::from_u32(255).is_err());
    }

    #[test]
    fn version_packing() {
        let v = ResourceVersion::new(1, 2, 3);
        assert_eq!(v.as_u32(), 0x010203);
        assert_eq!(ResourceVersion::from_u32(0x010203).unwrap(), v);
        assert!(ResourceVersion::from_u32(0x01000000).is_err());
    }

    #[test]
    fn container_classes() {
        assert!(ResourceType::Packfile.is_container());
        assert!(ResourceType::State.is_container());
        assert!(!ResourceType::Chunk.is_container());
        assert!(!ResourceType::Snapshot.is_container());
    }
}
