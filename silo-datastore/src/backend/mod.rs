//! The narrow storage capability every repository sits on.
//!
//! A backend stores opaque named objects in three categories plus the
//! one-time config resource. Names are always the 64 character hex
//! rendering of a MAC. Writes must be atomic on publish, reads of a
//! committed object must be total, and deleting an absent name is not an
//! error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use silo_api_types::Mac;

use crate::error::StoreError;

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// Object categories a backend distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Category {
    State,
    Packfile,
    Lock,
}

impl Category {
    pub fn name(self) -> &'static str {
        match self {
            Category::State => "state",
            Category::Packfile => "packfile",
            Category::Lock => "lock",
        }
    }
}

pub trait Backend: Send + Sync {
    /// Short human readable description, used in error messages.
    fn describe(&self) -> String;

    /// List all object names of a category.
    ///
    /// Lists may lag behind in-flight writes, nothing more.
    fn list(&self, category: Category) -> Result<Vec<Mac>, Error>;

    /// Fetch a complete object.
    fn get(&self, category: Category, mac: &Mac) -> Result<Vec<u8>, Error>;

    /// Fetch `length` bytes at `offset` of a packfile.
    fn get_range(&self, mac: &Mac, offset: u64, length: u64) -> Result<Vec<u8>, Error>;

    /// Fetch the last `length` bytes of a packfile (fewer if the object
    /// is shorter).
    fn get_tail(&self, mac: &Mac, length: u64) -> Result<Vec<u8>, Error>;

    /// Publish an object atomically.
    fn put(&self, category: Category, mac: &Mac, data: &[u8]) -> Result<(), Error>;

    /// Remove an object. Absent names are not an error.
    fn delete(&self, category: Category, mac: &Mac) -> Result<(), Error>;

    /// Write the one-time repository config. Fails if it already exists.
    fn create_config(&self, data: &[u8]) -> Result<(), Error>;

    /// Read the repository config.
    fn open_config(&self) -> Result<Vec<u8>, Error>;
}

/// Open a backend from a location spec.
///
/// `file://` URLs and bare paths resolve to [`LocalBackend`],
/// `memory:` to a fresh [`MemoryBackend`]. Unknown schemes are refused
/// here, at the single dispatch point.
pub fn open_backend(spec: &str) -> Result<Arc<dyn Backend>, Error> {
    dispatch(spec, false)
}

/// Like [`open_backend`], but initializes a fresh backend location.
pub fn create_backend(spec: &str) -> Result<Arc<dyn Backend>, Error> {
    dispatch(spec, true)
}

fn dispatch(spec: &str, create: bool) -> Result<Arc<dyn Backend>, Error> {
    if spec == "memory:" || spec == "memory://" {
        return Ok(Arc::new(MemoryBackend::new()));
    }

    let local = |path: std::path::PathBuf| -> Result<Arc<dyn Backend>, Error> {
        if create {
            Ok(Arc::new(LocalBackend::create(path)?))
        } else {
            Ok(Arc::new(LocalBackend::open(path)?))
        }
    };

    match url::Url::parse(spec) {
        Ok(url) if url.scheme() == "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| StoreError::Invalid(format!("bad file url '{}'", spec)))?;
            local(path)
        }
        Ok(url) => Err(StoreError::Invalid(format!(
            "unsupported backend scheme '{}'",
            url.scheme()
        ))
        .into()),
        // no scheme at all: treat as a local path
        Err(url::ParseError::RelativeUrlWithoutBase) => local(spec.into()),
        Err(err) => Err(StoreError::Invalid(format!("bad backend spec '{}' - {}", spec, err)).into()),
    }
}

fn is_retryable(err: &Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Backend { retryable: true, .. })
    )
}

/// Retry an idempotent read operation with bounded exponential backoff.
///
/// Only transport errors marked retryable are retried; everything else
/// propagates immediately.
pub fn retry_read<T, F>(what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut delay = Duration::from_millis(100);
    for _ in 0..3 {
        match op() {
            Err(err) if is_retryable(&err) => {
                log::warn!("retrying {} - {}", what, err);
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
    op()
}

/// Retry a write at most once.
pub fn retry_write<T, F>(what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    match op() {
        Err(err) if is_retryable(&err) => {
            log::warn!("retrying {} - {}", what, err);
            std::thread::sleep(Duration::from_millis(100));
            op()
        }
        other => other,
    }
}

/// Parse a 64 character hex object name back into a MAC.
pub(crate) fn parse_object_name(name: &str) -> Option<Mac> {
    if name.len() != 64 {
        return None;
    }
    let mut mac = [0u8; 32];
    hex::decode_to_slice(name, &mut mac).ok()?;
    Some(mac)
}

pub(crate) fn not_found(category: Category, mac: &Mac) -> Error {
    StoreError::NotFound(format!("{} {}", category.name(), hex::encode(mac))).into()
}

pub(crate) fn backend_err(retryable: bool, message: impl std::fmt::Display) -> Error {
    StoreError::Backend {
        retryable,
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheme_dispatch() {
        assert!(open_backend("memory:").is_ok());
        let err = open_backend("sftp://host/repo").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn object_names() {
        let mac = [0xabu8; 32];
        let name = hex::encode(mac);
        assert_eq!(parse_object_name(&name), Some(mac));
        assert_eq!(parse_object_name("deadbeef"), None);
        assert_eq!(parse_object_name(&name[..63]), None);
    }

    #[test]
    fn retry_gives_up_on_fatal_errors() {
        let mut calls = 0;
        let result: Result<(), Error> = retry_read("test op", || {
            calls += 1;
            Err(StoreError::Corruption("nope".into()).into())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
