//! Two-phase maintenance: colour, then sweep.
//!
//! The colour pass tombstones every packfile no live snapshot
//! references; the sweep pass physically removes tombstoned packfiles
//! once their tombstone has outlived the grace window, re-checking first
//! whether a snapshot created in between references them again (in
//! which case the tombstone is withdrawn).
//!
//! Both passes run under the repository exclusive lock, in separate
//! lock sessions so backups can run in between. The delta tombstoning a
//! packfile's blobs is always published before the packfile is deleted
//! from the backend: a crash in between leaves reclaimable cruft, never
//! dangling references.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{format_err, Error};

use silo_api_types::{Mac, MaintenanceStatus, ResourceType};
use silo_datastore::backend::Category;
use silo_datastore::file_formats::{PackfileFooter, PACKFILE_FOOTER_SIZE};
use silo_datastore::{task_log, task_warn, BlobLocation, StateDelta, StoreProgress, TaskControl};
use silo_tools::time::epoch_i64;
use silo_tools::HumanByte;

use crate::repository::Repository;

/// Default grace: a tombstoned packfile survives this long before the
/// sweep may remove it.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Clone, Debug)]
pub struct MaintenanceOptions {
    /// Minimum tombstone age before physical removal.
    pub grace: Duration,
    /// Host-local directory for the snapshot reference cache.
    pub cache_dir: PathBuf,
}

impl MaintenanceOptions {
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            grace: DEFAULT_GRACE,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Host-local cache of snapshot → referenced packfile edges.
///
/// One JSON file per snapshot MAC. Entries are idempotent (a snapshot's
/// edge set never changes), so warm-up only walks snapshots that are
/// not cached yet and evicts entries for tombstoned snapshots.
pub struct ReferenceCache {
    dir: PathBuf,
}

impl ReferenceCache {
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|err| format_err!("unable to create cache dir {:?} - {}", dir, err))?;
        Ok(Self { dir })
    }

    fn entry_path(&self, snapshot: &Mac) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(snapshot)))
    }

    pub fn contains(&self, snapshot: &Mac) -> bool {
        self.entry_path(snapshot).exists()
    }

    pub fn load(&self, snapshot: &Mac) -> Result<Option<HashSet<Mac>>, Error> {
        let path = self.entry_path(snapshot);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format_err!("unable to read {:?} - {}", path, err)),
        };

        let names: Vec<String> = serde_json::from_slice(&data)?;
        let mut macs = HashSet::with_capacity(names.len());
        for name in names {
            let mut mac = [0u8; 32];
            hex::decode_to_slice(&name, &mut mac)
                .map_err(|err| format_err!("bad cache entry in {:?} - {}", path, err))?;
            macs.insert(mac);
        }
        Ok(Some(macs))
    }

    pub fn store(&self, snapshot: &Mac, packfiles: &HashSet<Mac>) -> Result<(), Error> {
        let mut names: Vec<String> = packfiles.iter().map(hex::encode).collect();
        names.sort_unstable();

        let path = self.entry_path(snapshot);
        let tmp = self.dir.join(format!(".{}.tmp", hex::encode(snapshot)));
        std::fs::write(&tmp, serde_json::to_vec(&names)?)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|err| format_err!("unable to write {:?} - {}", path, err))
    }

    pub fn remove(&self, snapshot: &Mac) {
        let _ = std::fs::remove_file(self.entry_path(snapshot));
    }

    /// Phase 0: walk uncached snapshots, evict tombstoned ones.
    pub fn warm_up(
        &self,
        repo: &Repository,
        task: &dyn TaskControl,
        status: &mut MaintenanceStatus,
    ) -> Result<(), Error> {
        let aggregate = repo.aggregate();

        let mut progress =
            StoreProgress::new(aggregate.list(ResourceType::Snapshot).count() as u64);
        for (mac, _) in aggregate.list(ResourceType::Snapshot) {
            task.check_abort()?;
            progress.done += 1;
            if self.contains(mac) {
                continue;
            }
            match repo.snapshot_packfiles(mac) {
                Ok(packfiles) => self.store(mac, &packfiles)?,
                Err(err) => {
                    task_warn!(task, "snapshot {} walk failed - {}", hex::encode(mac), err);
                    status.item_errors += 1;
                }
            }
            if progress.at_step() {
                task_log!(task, "cache warm-up: {}", progress);
            }
        }

        for (mac, _) in aggregate.list_tombstoned(ResourceType::Snapshot) {
            self.remove(mac);
        }
        Ok(())
    }

    /// Union of the edge sets of all live snapshots.
    pub fn referenced_packfiles(&self, repo: &Repository) -> Result<HashSet<Mac>, Error> {
        let aggregate = repo.aggregate();
        let mut referenced = HashSet::new();
        for (mac, _) in aggregate.list(ResourceType::Snapshot) {
            if let Some(packfiles) = self.load(mac)? {
                referenced.extend(packfiles);
            }
        }
        Ok(referenced)
    }
}

fn random_scan() -> Result<[u8; 16], Error> {
    let mut scan = [0u8; 16];
    openssl::rand::rand_bytes(&mut scan)?;
    Ok(scan)
}

/// Reconstruct a packfile's total size from its footer.
fn packfile_size(repo: &Repository, mac: &Mac) -> Result<u64, Error> {
    let tail = repo
        .backend()
        .get_tail(mac, PACKFILE_FOOTER_SIZE as u64)?;
    let footer = PackfileFooter::from_bytes(&tail)?;
    Ok(footer.index_offset + footer.index_length + PACKFILE_FOOTER_SIZE as u64)
}

/// Phase 1: tombstone every live packfile no cached snapshot
/// references. Packfiles present on the backend but unknown to the
/// aggregate (left behind by aborted runs) are adopted the same way so
/// they age toward the sweep.
pub fn colour(
    repo: &Repository,
    options: &MaintenanceOptions,
    task: &dyn TaskControl,
) -> Result<MaintenanceStatus, Error> {
    let lock = repo.exclusive_lock()?;
    let mut status = MaintenanceStatus::default();

    repo.reload()?;

    let cache = ReferenceCache::open(&options.cache_dir)?;
    cache.warm_up(repo, task, &mut status)?;
    let referenced = cache.referenced_packfiles(repo)?;

    let aggregate = repo.aggregate();
    let now = epoch_i64();
    let mut delta = StateDelta::new(aggregate.next_serial(), random_scan()?);

    for mac in aggregate.list_packfiles() {
        task.check_abort()?;
        status.packfiles_examined += 1;
        if !referenced.contains(mac) {
            delta.tombstone(ResourceType::Packfile, *mac, now);
            status.packfiles_coloured += 1;
        }
    }

    // adopt packfiles the aggregate has never heard of
    let known: HashSet<&Mac> = aggregate
        .list_packfiles()
        .chain(aggregate.list_deleted_packfiles().map(|(mac, _)| mac))
        .collect();
    for mac in repo.backend().list(Category::Packfile)? {
        if !known.contains(&mac) {
            delta.tombstone(ResourceType::Packfile, mac, now);
            status.packfiles_adopted += 1;
        }
    }

    if !delta.is_empty() {
        repo.publish_delta(&delta)?;
    }
    lock.release();

    task_log!(
        task,
        "colour pass: {} packfiles examined, {} coloured, {} adopted",
        status.packfiles_examined,
        status.packfiles_coloured,
        status.packfiles_adopted
    );
    Ok(status)
}

/// Phase 2: physically remove tombstoned packfiles past the grace
/// window, un-colouring any that became referenced again. Orphan blob
/// records are tombstoned as well. Failures are per-packfile; the pass
/// continues.
pub fn sweep(
    repo: &Repository,
    options: &MaintenanceOptions,
    task: &dyn TaskControl,
) -> Result<MaintenanceStatus, Error> {
    let lock = repo.exclusive_lock()?;
    let mut status = MaintenanceStatus::default();

    repo.reload()?;

    // refresh the cache: snapshots committed since the colour pass get
    // their edges walked now, which is what the re-check below sees
    let cache = ReferenceCache::open(&options.cache_dir)?;
    cache.warm_up(repo, task, &mut status)?;
    let referenced = cache.referenced_packfiles(repo)?;

    let aggregate = repo.aggregate();
    let now = epoch_i64();
    let cutoff = now - options.grace.as_secs() as i64;

    let mut delta = StateDelta::new(aggregate.next_serial(), random_scan()?);
    let mut tombstoned_blobs: HashSet<(ResourceType, Mac)> = HashSet::new();
    let mut uncoloured: HashSet<Mac> = HashSet::new();
    let mut to_delete: Vec<Mac> = Vec::new();

    // only packfiles that still physically exist are sweep candidates;
    // tombstones of already removed ones stay behind until compaction
    let present: HashSet<Mac> = repo
        .backend()
        .list(Category::Packfile)?
        .into_iter()
        .collect();

    for (mac, time) in aggregate.list_deleted_packfiles() {
        task.check_abort()?;

        if !present.contains(mac) {
            continue;
        }

        if time > cutoff {
            status.packfiles_pending += 1;
            continue;
        }

        if referenced.contains(mac) {
            // a snapshot committed after the colour pass pins it again
            match packfile_size(repo, mac) {
                Ok(size) => {
                    delta.insert(
                        ResourceType::Packfile,
                        *mac,
                        BlobLocation {
                            packfile: *mac,
                            offset: 0,
                            length: size,
                            flags: 0,
                        },
                    );
                    status.packfiles_uncoloured += 1;
                    uncoloured.insert(*mac);
                }
                Err(err) => {
                    task_warn!(task, "un-colour of {} failed - {}", hex::encode(mac), err);
                    status.item_errors += 1;
                }
            }
            continue;
        }

        for (ty, blob) in aggregate.blobs_in_packfile(mac) {
            if tombstoned_blobs.insert((ty, blob)) {
                delta.tombstone(ty, blob, now);
                status.blobs_tombstoned += 1;
            }
        }

        match packfile_size(repo, mac) {
            Ok(size) => status.removed_bytes += size,
            Err(_) => (), // already gone or unreadable, still try the delete
        }
        to_delete.push(*mac);
    }

    // blobs whose host packfile is gone entirely (aborted runs, earlier
    // partial sweeps); packfiles just un-coloured do not orphan theirs
    for (ty, mac, location) in aggregate.orphan_blobs(cutoff) {
        if uncoloured.contains(&location.packfile) {
            continue;
        }
        if tombstoned_blobs.insert((ty, mac)) {
            delta.tombstone(ty, mac, now);
            status.orphans_tombstoned += 1;
        }
    }

    // durability of the delta strictly precedes physical removal
    if !delta.is_empty() {
        repo.publish_delta(&delta)?;
    }

    for mac in to_delete {
        task.check_abort()?;
        match repo.backend().delete(Category::Packfile, &mac) {
            Ok(()) => status.packfiles_swept += 1,
            Err(err) => {
                task_warn!(task, "delete of {} failed - {}", hex::encode(mac), err);
                status.item_errors += 1;
            }
        }
    }

    lock.release();

    task_log!(
        task,
        "sweep pass: {} swept, {} un-coloured, {} pending, {} blob tombstones, {} orphans",
        status.packfiles_swept,
        status.packfiles_uncoloured,
        status.packfiles_pending,
        status.blobs_tombstoned,
        status.orphans_tombstoned
    );
    task_log!(task, "reclaimed: {}", HumanByte::from(status.removed_bytes));
    Ok(status)
}

/// Merge every published state into one and remove the old state
/// objects from the backend.
///
/// The compacted delta reproduces the exact aggregate view, including
/// tombstones and their timestamps (grace windows survive compaction).
/// Runs under the exclusive lock; lock-free readers that raced the
/// removal recover by reloading.
pub fn compact_states(repo: &Repository, task: &dyn TaskControl) -> Result<(usize, usize), Error> {
    let lock = repo.exclusive_lock()?;

    repo.reload()?;
    let aggregate = repo.aggregate();
    let old_states: Vec<Mac> = aggregate.applied_states().copied().collect();

    let compacted = aggregate.compact_into(aggregate.next_serial(), random_scan()?);
    let op_count = compacted.op_count();
    let new_state = repo.publish_delta(&compacted)?;

    let mut removed = 0;
    for mac in old_states {
        task.check_abort()?;
        if mac == new_state {
            continue;
        }
        match repo.backend().delete(Category::State, &mac) {
            Ok(()) => removed += 1,
            Err(err) => {
                task_warn!(task, "removing state {} failed - {}", hex::encode(mac), err)
            }
        }
    }

    lock.release();

    task_log!(
        task,
        "compacted {} states into one ({} ops)",
        removed,
        op_count
    );
    Ok((removed, op_count))
}
