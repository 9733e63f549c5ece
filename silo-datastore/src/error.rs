use silo_api_types::{ResourceType, ResourceVersion};

/// Error classes of the storage core.
///
/// Most functions return `anyhow::Error`; values of this type are placed
/// inside whenever a caller may want to react to the class
/// (`err.downcast_ref::<StoreError>()`). `Corruption`, `Integrity` and
/// `BadVersion` are always fatal; `Backend { retryable: true }` may be
/// retried by call sites that know the operation is idempotent.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Framing or digest mismatch, truncated footer, malformed payload.
    #[error("corrupt resource - {0}")]
    Corruption(String),

    /// The backend has no object for a MAC.
    #[error("{0} not found")]
    NotFound(String),

    /// The repository exclusive lock is held elsewhere.
    #[error("repository is locked by {holder} since {since}")]
    Locked { holder: String, since: i64 },

    /// A snapshot prefix matched more than one snapshot.
    #[error("snapshot prefix '{0}' is ambiguous")]
    Ambiguous(String),

    /// Persisted resource carries an unsupported major version.
    #[error("unsupported {ty} version {version}")]
    BadVersion {
        ty: ResourceType,
        version: ResourceVersion,
    },

    /// Transport level failure.
    #[error("backend error - {message}")]
    Backend { retryable: bool, message: String },

    /// The operation was cancelled through its task handle.
    #[error("operation cancelled")]
    Cancelled,

    /// Bad arguments.
    #[error("invalid argument - {0}")]
    Invalid(String),

    /// A blob's content did not match the MAC it is addressed by.
    #[error("integrity check failed - {0}")]
    Integrity(String),
}

impl StoreError {
    /// Whether a failed operation may be re-issued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { retryable: true, .. })
    }
}
