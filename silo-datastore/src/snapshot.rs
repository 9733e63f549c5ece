//! Snapshot payloads and the object tree they reference.
//!
//! A snapshot is itself a blob (type SNAPSHOT) whose payload names the
//! root object of the captured tree plus run metadata. Object blobs form
//! the traversable structure: their payloads list child references,
//! which maintenance walks to learn which packfiles a snapshot pins.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{Mac, ResourceType};

/// Reference to a blob by identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlobRef {
    pub ty: ResourceType,
    #[serde(with = "hex::serde")]
    pub mac: Mac,
}

/// One node of the object tree. Children of type `Object` recurse,
/// everything else is a leaf.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectNode {
    pub children: Vec<BlobRef>,
}

impl ObjectNode {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Snapshot payload: the root reference plus run metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    /// Random logical identity, independent of the storage address.
    pub identifier: String,
    pub time: i64,
    pub importer_root: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job: Option<String>,
    pub duration_secs: f64,
    pub summary: SourceSummary,
    /// Leading characters of `identifier`, shown to users and accepted
    /// as a load prefix.
    pub short_id: String,
    pub root: BlobRef,
}

pub const SHORT_ID_LEN: usize = 8;

impl Snapshot {
    pub fn new(importer_root: String, root: BlobRef, time: i64) -> Result<Self, Error> {
        let mut id = [0u8; 16];
        openssl::rand::rand_bytes(&mut id)?;
        let identifier = hex::encode(id);
        let short_id = identifier[..SHORT_ID_LEN].to_string();

        Ok(Self {
            identifier,
            time,
            importer_root,
            tags: Vec::new(),
            job: None,
            duration_secs: 0.0,
            summary: SourceSummary::default(),
            short_id,
            root,
        })
    }

    /// Whether a user-supplied prefix selects this snapshot.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.identifier.starts_with(&prefix.to_ascii_lowercase())
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let snapshot: Snapshot = serde_json::from_slice(data)?;
        if snapshot.root.ty != ResourceType::Object {
            bail!("snapshot root must be an object, got {}", snapshot.root.ty);
        }
        Ok(snapshot)
    }
}
