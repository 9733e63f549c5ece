//! Repository-wide locking through the backend store.
//!
//! A lock is a record under a random MAC plus a heartbeat task that
//! keeps its timestamp fresh. There is no consensus protocol: two
//! concurrent acquirers each see the other and the one whose MAC sorts
//! smaller wins, the other releases. Holders that stop heartbeating
//! turn stale and are evicted by the next acquirer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{current_version, Mac, ResourceType};
use silo_tools::{host, time::epoch_i64};

use crate::backend::{retry_write, Backend, Category};
use crate::error::StoreError;
use crate::resource::FramedResource;

pub const LOCK_RECORD_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockRecord {
    pub version: u32,
    /// Refreshed by the heartbeat; staleness is judged against this.
    pub timestamp: i64,
    pub hostname: String,
    pub exclusive: bool,
    /// The record embeds its own MAC so tie-breaks are a local
    /// comparison.
    #[serde(with = "hex::serde")]
    pub mac: Mac,
}

impl LockRecord {
    fn new(mac: Mac, exclusive: bool) -> Self {
        Self {
            version: LOCK_RECORD_VERSION,
            timestamp: epoch_i64(),
            hostname: host::nodename().to_string(),
            exclusive,
            mac,
        }
    }

    fn seal(&self) -> Result<Vec<u8>, Error> {
        let payload = serde_json::to_vec(self)?;
        let framed = FramedResource::encode(
            ResourceType::Lock,
            current_version(ResourceType::Lock),
            &payload,
            None,
            None,
        )?;
        Ok(framed.into_inner())
    }

    fn parse(raw: Vec<u8>) -> Result<Self, Error> {
        let framed = FramedResource::from_raw(raw)?;
        if framed.resource_type() != ResourceType::Lock {
            bail!("expected a lock resource, got {}", framed.resource_type());
        }
        let payload = framed.decode_container(None, false)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// Heartbeat rewrite interval.
    pub refresh_interval: Duration,
    /// A lock is stale once its timestamp is older than
    /// `refresh_interval * stale_factor`.
    pub stale_factor: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            stale_factor: 10,
        }
    }
}

impl LockOptions {
    pub fn staleness_cutoff(&self) -> i64 {
        (self.refresh_interval.as_secs() as i64 * self.stale_factor as i64).max(1)
    }
}

/// A held repository lock. Released explicitly or on drop.
pub struct RepositoryLock {
    backend: Arc<dyn Backend>,
    mac: Mac,
    exclusive: bool,
    heartbeat_stop: Option<crossbeam_channel::Sender<()>>,
    heartbeat: Option<std::thread::JoinHandle<()>>,
}

fn fetch_record(backend: &dyn Backend, mac: &Mac) -> Result<Option<LockRecord>, Error> {
    match backend.get(Category::Lock, mac) {
        Ok(raw) => Ok(Some(LockRecord::parse(raw)?)),
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound(_)) => Ok(None),
            _ => Err(err),
        },
    }
}

// How long an acquirer waits for a concurrently racing (larger MAC)
// acquirer to notice us and back off.
const RACE_BACKOFF_ROUNDS: u32 = 5;
const RACE_BACKOFF_DELAY: Duration = Duration::from_millis(250);

impl RepositoryLock {
    /// Acquire the repository-wide exclusive lock.
    pub fn exclusive(backend: Arc<dyn Backend>, opts: LockOptions) -> Result<Self, Error> {
        Self::acquire(backend, true, opts)
    }

    /// Acquire a shared lock; compatible with other shared locks.
    pub fn shared(backend: Arc<dyn Backend>, opts: LockOptions) -> Result<Self, Error> {
        Self::acquire(backend, false, opts)
    }

    fn acquire(backend: Arc<dyn Backend>, exclusive: bool, opts: LockOptions) -> Result<Self, Error> {
        let mut mac = [0u8; 32];
        openssl::rand::rand_bytes(&mut mac)?;

        let record = LockRecord::new(mac, exclusive);
        backend.put(Category::Lock, &mac, &record.seal()?)?;

        match Self::check_conflicts(backend.as_ref(), &mac, exclusive, &opts) {
            Ok(()) => (),
            Err(err) => {
                let _ = backend.delete(Category::Lock, &mac);
                return Err(err);
            }
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let heartbeat = {
            let backend = Arc::clone(&backend);
            let interval = opts.refresh_interval;
            std::thread::spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let record = LockRecord::new(mac, exclusive);
                        let sealed = match record.seal() {
                            Ok(sealed) => sealed,
                            Err(err) => {
                                log::error!("lock heartbeat encode failed - {}", err);
                                continue;
                            }
                        };
                        if let Err(err) = retry_write("lock heartbeat", || {
                            backend.put(Category::Lock, &mac, &sealed)
                        }) {
                            log::error!("lock heartbeat write failed - {}", err);
                        }
                    }
                }
            })
        };

        Ok(Self {
            backend,
            mac,
            exclusive,
            heartbeat_stop: Some(stop_tx),
            heartbeat: Some(heartbeat),
        })
    }

    /// Scan all other lock records. Stale ones are evicted, established
    /// conflicting ones fail the acquisition, and racing acquirers that
    /// sort above us get a short window to back off.
    fn check_conflicts(
        backend: &dyn Backend,
        own: &Mac,
        exclusive: bool,
        opts: &LockOptions,
    ) -> Result<(), Error> {
        let mut rounds = 0;
        loop {
            let now = epoch_i64();
            let cutoff = now - opts.staleness_cutoff();

            let mut yielding = 0;
            for other in backend.list(Category::Lock)? {
                if &other == own {
                    continue;
                }
                let record = match fetch_record(backend, &other)? {
                    Some(record) => record,
                    None => continue, // released meanwhile
                };

                if record.timestamp < cutoff {
                    // holder stopped heartbeating, evict (best effort)
                    log::info!(
                        "evicting stale lock {} held by {}",
                        hex::encode(other),
                        record.hostname
                    );
                    let _ = backend.delete(Category::Lock, &other);
                    continue;
                }

                // shared locks only conflict with exclusive ones
                if !exclusive && !record.exclusive {
                    continue;
                }

                if other < *own {
                    // the conflicting lock outranks us
                    return Err(StoreError::Locked {
                        holder: record.hostname,
                        since: record.timestamp,
                    }
                    .into());
                }

                // we outrank it: if its owner is racing us it will see
                // our record and back off; an established holder won't
                yielding += 1;
            }

            if yielding == 0 {
                return Ok(());
            }
            rounds += 1;
            if rounds > RACE_BACKOFF_ROUNDS {
                // still there, so it is an established holder
                let since = epoch_i64();
                return Err(StoreError::Locked {
                    holder: "concurrent holder".to_string(),
                    since,
                }
                .into());
            }
            std::thread::sleep(RACE_BACKOFF_DELAY);
        }
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.heartbeat_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
        let _ = self.backend.delete(Category::Lock, &self.mac);
    }

    /// Stop the heartbeat and remove the lock record.
    pub fn release(mut self) {
        self.shutdown();
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        self.shutdown();
    }
}
