//! Writer-produced state deltas.
//!
//! Every writer run (backup, cleanup, sync) publishes its effects as a
//! small append-only delta: ordered inserts and tombstones per resource
//! type, stamped with the writer's serial. Deltas are never modified
//! after publication; the aggregate view merges them all.

use std::collections::BTreeMap;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{current_version, Mac, ResourceType};
use silo_tools::RepositoryKey;

use crate::file_formats::BlobFlags;
use crate::resource::{content_mac, FramedResource};

/// Where a blob lives: a byte range inside one packfile.
///
/// The flags describing how the payload was framed ride along so a
/// located blob can be decoded from a single ranged read, without
/// touching the packfile index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlobLocation {
    #[serde(with = "hex::serde")]
    pub packfile: Mac,
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

impl BlobLocation {
    pub fn blob_flags(&self) -> BlobFlags {
        BlobFlags::from_bits_truncate(self.flags)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "op")]
pub enum StateOp {
    Insert {
        #[serde(with = "hex::serde")]
        mac: Mac,
        location: BlobLocation,
    },
    Tombstone {
        #[serde(with = "hex::serde")]
        mac: Mac,
        /// Wall clock time the tombstone was written, the base of the
        /// maintenance grace window.
        time: i64,
    },
}

impl StateOp {
    pub fn mac(&self) -> &Mac {
        match self {
            StateOp::Insert { mac, .. } => mac,
            StateOp::Tombstone { mac, .. } => mac,
        }
    }
}

/// One writer's set of repository changes, to be sealed as a STATE
/// resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateDelta {
    /// Strictly monotone per writer; global order is `(serial, state MAC)`.
    pub serial: u64,
    /// Random identifier of the producing run.
    #[serde(with = "hex::serde")]
    pub scan: [u8; 16],
    /// Per-type op lists; insertion order within a type is preserved.
    pub ops: BTreeMap<ResourceType, Vec<StateOp>>,
}

impl StateDelta {
    pub fn new(serial: u64, scan: [u8; 16]) -> Self {
        Self {
            serial,
            scan,
            ops: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, ty: ResourceType, mac: Mac, location: BlobLocation) {
        self.ops
            .entry(ty)
            .or_default()
            .push(StateOp::Insert { mac, location });
    }

    pub fn tombstone(&mut self, ty: ResourceType, mac: Mac, time: i64) {
        self.ops
            .entry(ty)
            .or_default()
            .push(StateOp::Tombstone { mac, time });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.values().all(|ops| ops.is_empty())
    }

    pub fn op_count(&self) -> usize {
        self.ops.values().map(|ops| ops.len()).sum()
    }

    /// Seal the delta into a framed STATE resource.
    ///
    /// Returns the delta's MAC (its backend name) and the framed bytes.
    pub fn seal(
        &self,
        key: Option<&RepositoryKey>,
        compress: Option<i32>,
    ) -> Result<(Mac, FramedResource), Error> {
        let payload = serde_json::to_vec(self)?;
        let mac = content_mac(key, &payload);
        let framed = FramedResource::encode(
            ResourceType::State,
            current_version(ResourceType::State),
            &payload,
            key,
            compress,
        )?;
        Ok((mac, framed))
    }

    /// Parse a framed STATE resource fetched from a backend.
    ///
    /// Returns the delta together with its content MAC so the caller can
    /// match it against the backend name it was listed under.
    pub fn parse(
        raw: Vec<u8>,
        key: Option<&RepositoryKey>,
        compressed: bool,
    ) -> Result<(Mac, StateDelta), Error> {
        let framed = FramedResource::from_raw(raw)?;
        if framed.resource_type() != ResourceType::State {
            bail!(
                "expected a state resource, got {}",
                framed.resource_type()
            );
        }
        let payload = framed.decode_container(key, compressed)?;
        let mac = content_mac(key, &payload);
        let delta: StateDelta = serde_json::from_slice(&payload)?;
        Ok((mac, delta))
    }
}
