//! This crate implements the storage core of a silo repository.
//!
//! # Data formats
//!
//! Every persisted byte range is a framed resource: a fixed envelope
//! carrying resource type, version and payload length, and a trailing
//! digest. Containers (the config, lock records, state deltas and
//! packfiles) are stored directly by a [backend]; every other resource
//! is a blob living inside exactly one packfile, addressed by the MAC
//! of its plaintext.
//!
//! A packfile aggregates blobs and ends with an index and a fixed-size
//! footer, so readers can serve any blob with single ranged reads and
//! never have to download whole containers.
//!
//! Writers describe their effects as state deltas: small, append-only
//! lists of inserts and tombstones stamped with a monotone serial. The
//! [aggregate] merges all deltas into the repository's "does this blob
//! exist, and where" oracle.
//!
//! # Garbage collection
//!
//! Deleting a snapshot only publishes a tombstone. Storage is reclaimed
//! by a two-phase maintenance pass (in the `silo-backup` crate): colour
//! tombstones unreferenced packfiles, sweep physically removes them once
//! their tombstones outlive the grace window. The tombstone timestamps
//! recorded in state deltas are what makes the grace window enforceable.
//!
//! # Locking
//!
//! Maintenance runs under the repository-wide exclusive lock; writers
//! hold shared locks. Locks live in the backend itself (see [lock]), so
//! mutual exclusion works for remote repositories too.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod error;
pub mod file_formats;
pub mod lock;
pub mod packfile;
pub mod resource;
pub mod snapshot;
pub mod state;
pub mod store_progress;
pub mod task;
pub mod write_stat;

pub use aggregate::StateAggregate;
pub use backend::{create_backend, open_backend, Backend, Category, LocalBackend, MemoryBackend};
pub use config::RepositoryConfig;
pub use error::StoreError;
pub use lock::{LockOptions, RepositoryLock};
pub use packfile::{PackfileBuilder, PackfileReader, SealedPackfile};
pub use resource::{content_mac, FramedResource};
pub use snapshot::{BlobRef, ObjectNode, Snapshot};
pub use state::{BlobLocation, StateDelta, StateOp};
pub use store_progress::StoreProgress;
pub use task::{AbortableTask, TaskControl};
pub use write_stat::WriteStat;
