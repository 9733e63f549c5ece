//! The merged view over all published state deltas.
//!
//! Ops carry a total order `(serial, state MAC, position in delta)`; each
//! `(type, mac)` record remembers the key of the op that produced its
//! current value and only yields to ops ordered later. Deltas can
//! therefore be applied in any order with an identical result, which is
//! what makes incremental reloads and backend list permutations safe.
//!
//! A tombstone hides a record from `locate`; an op ordered after the
//! tombstone may re-insert it (maintenance uses this to un-colour a
//! packfile that became referenced again).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Error;

use silo_api_types::{Mac, ResourceType};
use silo_tools::RepositoryKey;

use crate::backend::{retry_read, Backend, Category};
use crate::error::StoreError;
use crate::state::{BlobLocation, StateDelta, StateOp};

/// Total order of state ops across the whole repository.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct OpKey {
    pub serial: u64,
    pub state: Mac,
    pub index: u32,
}

#[derive(Clone, Debug)]
struct Record {
    location: Option<BlobLocation>,
    tombstone_time: Option<i64>,
    key: OpKey,
}

#[derive(Clone)]
pub struct StateAggregate {
    entries: BTreeMap<(ResourceType, Mac), Record>,
    applied: BTreeSet<Mac>,
    max_serial: u64,
}

impl StateAggregate {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            applied: BTreeSet::new(),
            max_serial: 0,
        }
    }

    /// Load every state the backend lists.
    pub fn load(
        backend: &dyn Backend,
        key: Option<&RepositoryKey>,
        compressed: bool,
    ) -> Result<Self, Error> {
        let mut aggregate = Self::empty();
        aggregate.reload(backend, key, compressed)?;
        Ok(aggregate)
    }

    /// Apply all states not merged yet, returning how many were applied.
    pub fn reload(
        &mut self,
        backend: &dyn Backend,
        key: Option<&RepositoryKey>,
        compressed: bool,
    ) -> Result<usize, Error> {
        let listed = retry_read("state list", || backend.list(Category::State))?;

        let mut applied = 0;
        for state_mac in listed {
            if self.applied.contains(&state_mac) {
                continue;
            }

            let raw = retry_read("state read", || backend.get(Category::State, &state_mac))?;
            let (content_mac, delta) = StateDelta::parse(raw, key, compressed)?;
            if content_mac != state_mac {
                return Err(StoreError::Integrity(format!(
                    "state {} does not match its content MAC",
                    hex::encode(state_mac)
                ))
                .into());
            }

            self.apply_delta(&state_mac, &delta);
            applied += 1;
        }
        Ok(applied)
    }

    /// Merge one delta. Idempotent per state MAC.
    pub fn apply_delta(&mut self, state_mac: &Mac, delta: &StateDelta) {
        if !self.applied.insert(*state_mac) {
            return;
        }

        let mut index = 0u32;
        for (ty, ops) in &delta.ops {
            for op in ops {
                let key = OpKey {
                    serial: delta.serial,
                    state: *state_mac,
                    index,
                };
                index += 1;
                self.apply_op(*ty, op, key);
            }
        }

        if delta.serial > self.max_serial {
            self.max_serial = delta.serial;
        }
    }

    fn apply_op(&mut self, ty: ResourceType, op: &StateOp, key: OpKey) {
        let entry = self.entries.entry((ty, *op.mac()));

        let record = match op {
            StateOp::Insert { location, .. } => Record {
                location: Some(*location),
                tombstone_time: None,
                key,
            },
            StateOp::Tombstone { time, .. } => Record {
                location: None,
                tombstone_time: Some(*time),
                key,
            },
        };

        match entry {
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
            std::collections::btree_map::Entry::Occupied(mut occupied) => {
                if key > occupied.get().key {
                    occupied.insert(record);
                }
            }
        }
    }

    /// Largest serial merged so far.
    pub fn max_serial(&self) -> u64 {
        self.max_serial
    }

    /// Serial a new writer should stamp its delta with.
    pub fn next_serial(&self) -> u64 {
        self.max_serial + 1
    }

    pub fn state_count(&self) -> usize {
        self.applied.len()
    }

    pub fn contains_state(&self, state_mac: &Mac) -> bool {
        self.applied.contains(state_mac)
    }

    /// Current location of a resource, if present and not tombstoned.
    pub fn locate(&self, ty: ResourceType, mac: &Mac) -> Option<BlobLocation> {
        self.entries.get(&(ty, *mac)).and_then(|r| r.location)
    }

    pub fn is_tombstoned(&self, ty: ResourceType, mac: &Mac) -> bool {
        self.entries
            .get(&(ty, *mac))
            .map(|r| r.tombstone_time.is_some())
            .unwrap_or(false)
    }

    /// All live records of a type, in MAC order.
    pub fn list(&self, ty: ResourceType) -> impl Iterator<Item = (&Mac, &BlobLocation)> {
        self.entries
            .range((ty, [0u8; 32])..=(ty, [0xffu8; 32]))
            .filter_map(|((_, mac), record)| record.location.as_ref().map(|loc| (mac, loc)))
    }

    /// Live packfile MACs.
    pub fn list_packfiles(&self) -> impl Iterator<Item = &Mac> {
        self.list(ResourceType::Packfile).map(|(mac, _)| mac)
    }

    /// Tombstoned records of a type with their tombstone timestamps.
    pub fn list_tombstoned(&self, ty: ResourceType) -> impl Iterator<Item = (&Mac, i64)> {
        self.entries
            .range((ty, [0u8; 32])..=(ty, [0xffu8; 32]))
            .filter_map(|((_, mac), record)| record.tombstone_time.map(|time| (mac, time)))
    }

    /// Tombstoned packfiles with their tombstone timestamps.
    pub fn list_deleted_packfiles(&self) -> impl Iterator<Item = (&Mac, i64)> {
        self.list_tombstoned(ResourceType::Packfile)
    }

    /// Live blob records stored inside the given packfile.
    pub fn blobs_in_packfile(&self, packfile: &Mac) -> Vec<(ResourceType, Mac)> {
        self.entries
            .iter()
            .filter(|((ty, _), record)| {
                !ty.is_container()
                    && record
                        .location
                        .map(|loc| &loc.packfile == packfile)
                        .unwrap_or(false)
            })
            .map(|((ty, mac), _)| (*ty, *mac))
            .collect()
    }

    /// Flatten the whole view into a single equivalent delta.
    ///
    /// Live records become inserts, tombstoned records keep their
    /// tombstones (and timestamps, so grace windows survive). Applying
    /// the result on an empty aggregate reproduces every query answer.
    pub fn compact_into(&self, serial: u64, scan: [u8; 16]) -> StateDelta {
        let mut delta = StateDelta::new(serial, scan);
        for ((ty, mac), record) in &self.entries {
            match (record.location, record.tombstone_time) {
                (Some(location), _) => delta.insert(*ty, *mac, location),
                (None, Some(time)) => delta.tombstone(*ty, *mac, time),
                (None, None) => (),
            }
        }
        delta
    }

    /// State MACs merged into this view.
    pub fn applied_states(&self) -> impl Iterator<Item = &Mac> {
        self.applied.iter()
    }

    /// Blobs whose host packfile is gone: either absent from the live
    /// set entirely, or tombstoned with a timestamp at or before
    /// `cutoff`. Packfiles still inside their grace window do not orphan
    /// their blobs yet.
    pub fn orphan_blobs(&self, cutoff: i64) -> Vec<(ResourceType, Mac, BlobLocation)> {
        let live: HashSet<&Mac> = self.list_packfiles().collect();
        let deleted: HashMap<&Mac, i64> = self.list_deleted_packfiles().collect();

        let mut orphans = Vec::new();
        for ((ty, mac), record) in &self.entries {
            if ty.is_container() {
                continue;
            }
            let location = match record.location {
                Some(location) => location,
                None => continue,
            };
            if live.contains(&location.packfile) {
                continue;
            }
            match deleted.get(&location.packfile) {
                Some(&time) if time > cutoff => (), // still in grace
                _ => orphans.push((*ty, *mac, location)),
            }
        }
        orphans
    }
}
