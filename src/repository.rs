//! The repository facade: configuration, pipeline setup, the shared
//! aggregate view, blob reads and the snapshot lifecycle.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use anyhow::{bail, format_err, Error};

use silo_api_types::{Fingerprint, Mac, ResourceType};
use silo_datastore::backend::{retry_read, retry_write, Backend, Category};
use silo_datastore::config::{CipherAlgorithm, CompressionConfig, EncryptionConfig};
use silo_datastore::snapshot::{BlobRef, ObjectNode, Snapshot};
use silo_datastore::{
    content_mac, task_log, task_warn, BlobLocation, FramedResource, LockOptions, PackfileReader,
    RepositoryConfig, RepositoryLock, StateAggregate, StateDelta, StoreError, StoreProgress,
    TaskControl,
};
use silo_key_config::{Kdf, KeyCanary, KeyDerivationConfig};
use silo_tools::time::epoch_i64;
use silo_tools::RepositoryKey;

use crate::writer::{RepositoryWriter, WriterOptions};

/// Settings for a fresh repository.
pub struct CreateOptions {
    pub compression: CompressionConfig,
    pub kdf: Kdf,
    pub passphrase: Option<String>,
    pub packfile_max_size: Option<u64>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            kdf: Kdf::default(),
            passphrase: None,
            packfile_max_size: Some(silo_datastore::config::DEFAULT_PACKFILE_MAX_SIZE),
        }
    }
}

/// Counters of a verification pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct VerifyStatus {
    pub packfiles: usize,
    pub blobs: usize,
    pub errors: usize,
}

pub struct Repository {
    backend: Arc<dyn Backend>,
    config: RepositoryConfig,
    crypt: Option<Arc<RepositoryKey>>,
    aggregate: RwLock<Arc<StateAggregate>>,
    lock_options: LockOptions,
}

impl Repository {
    /// Initialize a repository on a prepared backend.
    pub fn create(backend: Arc<dyn Backend>, options: CreateOptions) -> Result<Arc<Self>, Error> {
        let (encryption, crypt) = match &options.passphrase {
            Some(passphrase) => {
                let kdf = KeyDerivationConfig::generate(options.kdf)?;
                let key = kdf.derive_key(passphrase.as_bytes())?;
                let crypt = Arc::new(RepositoryKey::new(key)?);
                let encryption = EncryptionConfig {
                    algorithm: CipherAlgorithm::Aes256Gcm,
                    kdf,
                    canary: KeyCanary::create(&crypt)?,
                    fingerprint: Fingerprint::new(crypt.fingerprint()),
                };
                (Some(encryption), Some(crypt))
            }
            None => (None, None),
        };

        let config = RepositoryConfig::new(
            options.compression,
            encryption,
            options.packfile_max_size,
        )?;
        backend.create_config(&config.seal()?)?;

        log::info!("created repository {}", config.uuid);

        Ok(Arc::new(Self {
            backend,
            config,
            crypt,
            aggregate: RwLock::new(Arc::new(StateAggregate::empty())),
            lock_options: LockOptions::default(),
        }))
    }

    /// Open an existing repository and load the aggregate view.
    ///
    /// An encrypted repository requires the passphrase; it is verified
    /// against the stored canary and key fingerprint before anything is
    /// read.
    pub fn open(backend: Arc<dyn Backend>, passphrase: Option<&str>) -> Result<Arc<Self>, Error> {
        let config = RepositoryConfig::parse(backend.open_config()?)?;

        let crypt = match (&config.encryption, passphrase) {
            (Some(encryption), Some(passphrase)) => {
                let key = encryption.kdf.derive_key(passphrase.as_bytes())?;
                let crypt = Arc::new(RepositoryKey::new(key)?);
                encryption.canary.verify(&crypt)?;
                let fingerprint = Fingerprint::new(crypt.fingerprint());
                if fingerprint != encryption.fingerprint {
                    bail!(
                        "key fingerprint mismatch - repository expects {}",
                        encryption.fingerprint
                    );
                }
                Some(crypt)
            }
            (Some(_), None) => {
                return Err(StoreError::Invalid(
                    "repository is encrypted - passphrase required".to_string(),
                )
                .into())
            }
            (None, Some(_)) => {
                return Err(StoreError::Invalid(
                    "repository is not encrypted - unexpected passphrase".to_string(),
                )
                .into())
            }
            (None, None) => None,
        };

        log::info!(
            "opening repository {} on {} (crypt mode {:?})",
            config.uuid,
            backend.describe(),
            config.crypt_mode()
        );

        let repo = Self {
            backend,
            config,
            crypt,
            aggregate: RwLock::new(Arc::new(StateAggregate::empty())),
            lock_options: LockOptions::default(),
        };
        repo.reload()?;
        Ok(Arc::new(repo))
    }

    /// Open via a location spec (`file://...`, a bare path, `memory:`).
    pub fn open_location(spec: &str, passphrase: Option<&str>) -> Result<Arc<Self>, Error> {
        Self::open(silo_datastore::open_backend(spec)?, passphrase)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn crypt(&self) -> Option<&Arc<RepositoryKey>> {
        self.crypt.as_ref()
    }

    /// zstd level for container payloads, `None` when compression is
    /// disabled.
    pub fn compression_level(&self) -> Option<i32> {
        self.config.compression.zstd_level()
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock_options
    }

    /// Snapshot-consistent handle on the merged state view.
    pub fn aggregate(&self) -> Arc<StateAggregate> {
        self.aggregate.read().unwrap().clone()
    }

    /// Merge states published since the last load. Readers holding a
    /// previous aggregate handle are unaffected.
    pub fn reload(&self) -> Result<usize, Error> {
        let mut next = (**self.aggregate.read().unwrap()).clone();
        let applied = next.reload(
            self.backend.as_ref(),
            self.crypt.as_deref(),
            self.compression_level().is_some(),
        )?;
        if applied > 0 {
            *self.aggregate.write().unwrap() = Arc::new(next);
        }
        Ok(applied)
    }

    /// Seal and publish a state delta, then fold it into the local view.
    pub fn publish_delta(&self, delta: &StateDelta) -> Result<Mac, Error> {
        let (mac, framed) = delta.seal(self.crypt.as_deref(), self.compression_level())?;
        retry_write("state publish", || {
            self.backend.put(Category::State, &mac, framed.raw_data())
        })?;

        let mut next = (**self.aggregate.read().unwrap()).clone();
        next.apply_delta(&mac, delta);
        *self.aggregate.write().unwrap() = Arc::new(next);

        log::debug!(
            "published state {} (serial {}, {} ops)",
            hex::encode(mac),
            delta.serial,
            delta.op_count()
        );
        Ok(mac)
    }

    pub fn locate(&self, ty: ResourceType, mac: &Mac) -> Option<BlobLocation> {
        self.aggregate().locate(ty, mac)
    }

    /// Read a blob by identity: locate it, fetch its byte range, verify
    /// envelope and content MAC.
    pub fn read_blob(&self, ty: ResourceType, mac: &Mac) -> Result<Vec<u8>, Error> {
        let location = self
            .locate(ty, mac)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", ty, hex::encode(mac))))?;
        self.read_located(ty, mac, &location)
    }

    /// Read a blob from a known location with full verification.
    pub fn read_located(
        &self,
        ty: ResourceType,
        mac: &Mac,
        location: &BlobLocation,
    ) -> Result<Vec<u8>, Error> {
        let raw = retry_read("blob read", || {
            self.backend
                .get_range(&location.packfile, location.offset, location.length)
        })
        .map_err(|err| match err.downcast_ref::<StoreError>() {
            // the aggregate promised this range exists, so an absent
            // packfile means the store is damaged
            Some(StoreError::NotFound(_)) => StoreError::Integrity(format!(
                "packfile {} expected by the aggregate is missing",
                hex::encode(location.packfile)
            ))
            .into(),
            _ => err,
        })?;

        let framed = FramedResource::from_raw(raw)?;
        if framed.resource_type() != ty {
            return Err(StoreError::Integrity(format!(
                "expected {} at {}+{} in packfile {}, found {}",
                ty,
                location.offset,
                location.length,
                hex::encode(location.packfile),
                framed.resource_type()
            ))
            .into());
        }

        let data = framed.decode(self.crypt.as_deref(), location.blob_flags())?;
        if &content_mac(self.crypt.as_deref(), &data) != mac {
            return Err(StoreError::Integrity(format!(
                "blob {} read from packfile {} does not match its MAC",
                hex::encode(mac),
                hex::encode(location.packfile)
            ))
            .into());
        }
        Ok(data)
    }

    pub fn shared_lock(&self) -> Result<RepositoryLock, Error> {
        RepositoryLock::shared(Arc::clone(&self.backend), self.lock_options)
    }

    pub fn exclusive_lock(&self) -> Result<RepositoryLock, Error> {
        RepositoryLock::exclusive(Arc::clone(&self.backend), self.lock_options)
    }

    /// Start a writer transaction with its packer pipeline.
    pub fn writer(&self, options: WriterOptions) -> Result<RepositoryWriter<'_>, Error> {
        RepositoryWriter::new(self, options)
    }

    /// All live snapshots, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<(Mac, Snapshot)>, Error> {
        let aggregate = self.aggregate();
        let mut snapshots = Vec::new();
        for (mac, location) in aggregate.list(ResourceType::Snapshot) {
            let data = self.read_located(ResourceType::Snapshot, mac, location)?;
            snapshots.push((*mac, Snapshot::parse(&data)?));
        }
        snapshots.sort_by_key(|(_, snapshot)| std::cmp::Reverse(snapshot.time));
        Ok(snapshots)
    }

    /// Resolve a short-id prefix to exactly one snapshot.
    pub fn load_snapshot(&self, prefix: &str) -> Result<(Mac, Snapshot), Error> {
        if prefix.is_empty() {
            return Err(StoreError::Invalid("empty snapshot prefix".to_string()).into());
        }

        let mut matched = Vec::new();
        for (mac, snapshot) in self.list_snapshots()? {
            if snapshot.matches_prefix(prefix) {
                matched.push((mac, snapshot));
            }
        }

        match matched.len() {
            0 => Err(StoreError::NotFound(format!("snapshot '{}'", prefix)).into()),
            1 => Ok(matched.remove(0)),
            _ => Err(StoreError::Ambiguous(prefix.to_string()).into()),
        }
    }

    /// Tombstone a snapshot. Its unique blobs are reclaimed later by
    /// maintenance.
    pub fn delete_snapshot(&self, mac: &Mac) -> Result<Mac, Error> {
        let aggregate = self.aggregate();
        if aggregate.locate(ResourceType::Snapshot, mac).is_none() {
            return Err(StoreError::NotFound(format!("snapshot {}", hex::encode(mac))).into());
        }

        let mut scan = [0u8; 16];
        openssl::rand::rand_bytes(&mut scan)?;
        let mut delta = StateDelta::new(aggregate.next_serial(), scan);
        delta.tombstone(ResourceType::Snapshot, *mac, epoch_i64());
        self.publish_delta(&delta)
    }

    /// The set of packfiles a snapshot pins, derived by walking its
    /// object tree. Includes the packfile holding the snapshot blob
    /// itself.
    pub fn snapshot_packfiles(&self, mac: &Mac) -> Result<HashSet<Mac>, Error> {
        let aggregate = self.aggregate();
        let mut packfiles = HashSet::new();

        let location = aggregate
            .locate(ResourceType::Snapshot, mac)
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {}", hex::encode(mac))))?;
        packfiles.insert(location.packfile);

        let snapshot = Snapshot::parse(&self.read_located(ResourceType::Snapshot, mac, &location)?)?;

        let mut queue: Vec<BlobRef> = vec![snapshot.root];
        let mut seen: HashSet<(ResourceType, Mac)> = HashSet::new();

        while let Some(blob) = queue.pop() {
            if !seen.insert((blob.ty, blob.mac)) {
                continue;
            }
            let location = aggregate.locate(blob.ty, &blob.mac).ok_or_else(|| {
                format_err!(
                    "snapshot {} references unlocatable {} {}",
                    hex::encode(mac),
                    blob.ty,
                    hex::encode(blob.mac)
                )
            })?;
            packfiles.insert(location.packfile);

            if blob.ty == ResourceType::Object {
                let node =
                    ObjectNode::parse(&self.read_located(blob.ty, &blob.mac, &location)?)?;
                queue.extend(node.children);
            }
        }

        Ok(packfiles)
    }

    /// Verify every live packfile: footer MAC, container MAC and every
    /// blob. Failures are per-packfile, logged and counted.
    pub fn verify(&self, task: &dyn TaskControl) -> Result<VerifyStatus, Error> {
        let aggregate = self.aggregate();
        let mut status = VerifyStatus::default();

        let mut progress = StoreProgress::new(aggregate.list_packfiles().count() as u64);
        for mac in aggregate.list_packfiles() {
            task.check_abort()?;
            status.packfiles += 1;
            progress.done += 1;

            let result = PackfileReader::open(
                Arc::clone(&self.backend),
                self.crypt.clone(),
                *mac,
            )
            .and_then(|reader| {
                let blobs = reader.blob_count();
                reader.verify()?;
                Ok(blobs)
            });

            match result {
                Ok(blobs) => status.blobs += blobs,
                Err(err) => {
                    task_warn!(task, "packfile {} failed - {}", hex::encode(mac), err);
                    status.errors += 1;
                }
            }

            if progress.at_step() {
                task_log!(task, "verified {}", progress);
            }
        }

        task_log!(
            task,
            "verified {} packfiles ({} blobs, {} errors)",
            status.packfiles,
            status.blobs,
            status.errors
        );
        Ok(status)
    }
}
