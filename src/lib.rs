//! High level operations of a silo repository: open/create, the
//! repository writer with its packer pipeline, snapshot lifecycle and
//! the two-phase maintenance pass.

pub mod maintenance;
pub mod repository;
pub mod writer;

pub use maintenance::{colour, compact_states, sweep, MaintenanceOptions, ReferenceCache};
pub use repository::{CreateOptions, Repository, VerifyStatus};
pub use writer::{RepositoryWriter, WriterOptions};
