//! The repository writer and its packer pipeline.
//!
//! A writer is one transaction: blobs stream in through `put`, a small
//! pool of worker threads frames them into packfiles, and `commit`
//! publishes a single state delta making everything visible at once.
//! Workers own their packfile builder exclusively; the shared delta is
//! the only cross-thread structure and is guarded by a short-held mutex.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use silo_api_types::{Mac, ResourceType};
use silo_datastore::backend::Backend;
use silo_datastore::snapshot::Snapshot;
use silo_datastore::{
    content_mac, AbortableTask, BlobLocation, PackfileBuilder, RepositoryLock, StateDelta,
    StoreError, TaskControl, WriteStat,
};
use silo_tools::RepositoryKey;

use crate::repository::Repository;

#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    /// Number of packer workers, each owning one open packfile.
    pub concurrency: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

struct WorkItem {
    ty: ResourceType,
    mac: Mac,
    payload: Vec<u8>,
}

struct WriterShared {
    backend: Arc<dyn Backend>,
    crypt: Option<Arc<RepositoryKey>>,
    compress: Option<i32>,
    max_size: Option<u64>,
    delta: Mutex<StateDelta>,
    stat: Mutex<WriteStat>,
    task: AbortableTask,
}

impl WriterShared {
    /// Seal a finished packfile and fold its records into the delta:
    /// one insert for the container itself, one per blob.
    fn publish_packfile(&self, builder: PackfileBuilder) -> Result<(), Error> {
        let sealed = builder.seal(self.backend.as_ref())?;

        let mut delta = self.delta.lock().unwrap();
        delta.insert(
            ResourceType::Packfile,
            sealed.mac,
            BlobLocation {
                packfile: sealed.mac,
                offset: 0,
                length: sealed.size,
                flags: 0,
            },
        );
        for record in sealed.records {
            delta.insert(
                record.resource_type,
                record.mac,
                BlobLocation {
                    packfile: sealed.mac,
                    offset: record.offset,
                    length: record.length,
                    flags: record.flags.bits(),
                },
            );
        }

        let mut stat = self.stat.lock().unwrap();
        stat.disk_size += sealed.size;
        stat.packfile_count += 1;

        log::debug!(
            "published packfile {} ({} bytes)",
            hex::encode(sealed.mac),
            sealed.size
        );
        Ok(())
    }
}

fn packer_worker(
    shared: &WriterShared,
    rx: crossbeam_channel::Receiver<WorkItem>,
) -> Result<(), Error> {
    let mut builder = PackfileBuilder::new(shared.crypt.clone(), shared.compress);
    let mut result = Ok(());

    // keep draining the channel after a failure, so queued senders are
    // never blocked on a dead worker
    for item in rx.iter() {
        if result.is_err() || shared.task.is_aborted() {
            continue;
        }
        result = (|| -> Result<(), Error> {
            // roll over before the append would cross the size bound
            if let Some(max_size) = shared.max_size {
                if !builder.is_empty() && builder.size() + item.payload.len() as u64 > max_size {
                    let full = std::mem::replace(
                        &mut builder,
                        PackfileBuilder::new(shared.crypt.clone(), shared.compress),
                    );
                    shared.publish_packfile(full)?;
                }
            }

            let (mac, _) = builder.append(item.ty, &item.payload)?;
            debug_assert_eq!(mac, item.mac);
            Ok(())
        })();
    }
    result?;

    if shared.task.is_aborted() {
        // drop the unpublished builder; uploaded packfiles become
        // orphans and are adopted by maintenance
        return Err(StoreError::Cancelled.into());
    }

    if !builder.is_empty() {
        shared.publish_packfile(builder)?;
    }
    Ok(())
}

/// One write transaction against a repository.
pub struct RepositoryWriter<'a> {
    repo: &'a Repository,
    shared: Arc<WriterShared>,
    tx: Option<crossbeam_channel::Sender<WorkItem>>,
    workers: Vec<std::thread::JoinHandle<Result<(), Error>>>,
    pending: Mutex<HashSet<(ResourceType, Mac)>>,
    scan: [u8; 16],
    _lock: RepositoryLock,
}

impl<'a> RepositoryWriter<'a> {
    pub(crate) fn new(repo: &'a Repository, options: WriterOptions) -> Result<Self, Error> {
        if options.concurrency == 0 {
            return Err(StoreError::Invalid("writer concurrency must be > 0".into()).into());
        }

        let lock = repo.shared_lock()?;

        let mut scan = [0u8; 16];
        openssl::rand::rand_bytes(&mut scan)?;

        let serial = repo.aggregate().next_serial();
        let shared = Arc::new(WriterShared {
            backend: Arc::clone(repo.backend()),
            crypt: repo.crypt().cloned(),
            compress: repo.compression_level(),
            max_size: repo.config().packfile.max_size,
            delta: Mutex::new(StateDelta::new(serial, scan)),
            stat: Mutex::new(WriteStat::default()),
            task: AbortableTask::new(),
        });

        let (tx, rx) = crossbeam_channel::bounded::<WorkItem>(options.concurrency * 2);
        let workers = (0..options.concurrency)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let rx = rx.clone();
                std::thread::spawn(move || packer_worker(&shared, rx))
            })
            .collect();

        Ok(Self {
            repo,
            shared,
            tx: Some(tx),
            workers,
            pending: Mutex::new(HashSet::new()),
            scan,
            _lock: lock,
        })
    }

    /// Identifier of this run, also stamped into the published delta.
    pub fn scan_id(&self) -> &[u8; 16] {
        &self.scan
    }

    /// Store a blob payload, returning its MAC.
    ///
    /// Deduplicates against the aggregate and against blobs already
    /// queued in this transaction; duplicate payloads cost one digest
    /// computation and nothing else.
    pub fn put(&self, ty: ResourceType, payload: &[u8]) -> Result<Mac, Error> {
        self.shared.task.check_abort()?;

        if ty.is_container() {
            return Err(
                StoreError::Invalid(format!("cannot write {} through a writer", ty)).into(),
            );
        }

        let mac = content_mac(self.shared.crypt.as_deref(), payload);

        if self.repo.locate(ty, &mac).is_some()
            || !self.pending.lock().unwrap().insert((ty, mac))
        {
            self.shared.stat.lock().unwrap().duplicate_blobs += 1;
            return Ok(mac);
        }

        {
            let mut stat = self.shared.stat.lock().unwrap();
            stat.size += payload.len() as u64;
            stat.blob_count += 1;
        }

        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| format_err!("writer already committed"))?;
        tx.send(WorkItem {
            ty,
            mac,
            payload: payload.to_vec(),
        })
        .map_err(|_| format_err!("packer pipeline terminated early"))?;

        Ok(mac)
    }

    /// Store a snapshot payload.
    pub fn put_snapshot(&self, snapshot: &Snapshot) -> Result<Mac, Error> {
        self.put(ResourceType::Snapshot, &snapshot.encode()?)
    }

    /// Counters of this run so far.
    pub fn stat(&self) -> WriteStat {
        self.shared.stat.lock().unwrap().clone()
    }

    /// Whether a blob is visible to this writer (already stored, or
    /// queued in this transaction).
    pub fn contains(&self, ty: ResourceType, mac: &Mac) -> bool {
        self.repo.locate(ty, mac).is_some() || self.pending.lock().unwrap().contains(&(ty, *mac))
    }

    /// Request cancellation; queued blobs are dropped, uploaded
    /// packfiles are left for maintenance to reclaim.
    pub fn abort(&self) {
        self.shared.task.abort();
    }

    fn join_workers(&mut self) -> Result<(), Error> {
        drop(self.tx.take());

        let mut first_error = None;
        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(format_err!("packer worker panicked"));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush all builders and publish the state delta.
    ///
    /// Returns the new state MAC, or `None` when nothing was written.
    /// Once the delta upload has begun the commit is not cancellable.
    pub fn commit(mut self) -> Result<Option<Mac>, Error> {
        self.join_workers()?;

        let delta = {
            let delta = self.shared.delta.lock().unwrap();
            if delta.is_empty() {
                return Ok(None);
            }
            delta.clone()
        };

        let state_mac = self.repo.publish_delta(&delta)?;
        log::info!("commit {:?}", self.stat());
        Ok(Some(state_mac))
    }
}

impl Drop for RepositoryWriter<'_> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            // transaction neither committed nor joined: tear it down
            self.shared.task.abort();
            let _ = self.join_workers();
        }
    }
}
