//! Packfile container format
//!
//! A packfile aggregates framed blobs into one backend object:
//!
//! ```text
//! [ blob 0 ] [ blob 1 ] ... [ blob n ] [ index ] [ footer ]
//! ```
//!
//! The index is the ordered list of fixed-size blob records, the footer
//! is fixed-size so one ranged tail read recovers it. A packfile is
//! sealed exactly once and immutable afterwards; its MAC is the digest
//! of the entire byte content.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Error;

use silo_api_types::{current_version, Mac, ResourceType};
use silo_tools::RepositoryKey;

use crate::backend::{retry_read, retry_write, Backend, Category};
use crate::error::StoreError;
use crate::file_formats::*;
use crate::resource::{content_mac, verify_content, FramedResource};

/// Result of sealing a packfile: its MAC, total size, and every blob
/// record with its final in-pack location.
pub struct SealedPackfile {
    pub mac: Mac,
    pub size: u64,
    pub records: Vec<BlobRecord>,
}

/// Streaming writer for one packfile.
///
/// Blobs are framed and appended to an in-memory buffer; `seal` writes
/// index and footer and uploads the finished container. Size policy is
/// the owner's business: builders never refuse an append.
pub struct PackfileBuilder {
    crypt: Option<Arc<RepositoryKey>>,
    compress: Option<i32>,
    buf: Vec<u8>,
    records: Vec<BlobRecord>,
    known: HashMap<(ResourceType, Mac), usize>,
}

impl PackfileBuilder {
    pub fn new(crypt: Option<Arc<RepositoryKey>>, compress: Option<i32>) -> Self {
        Self {
            crypt,
            compress,
            buf: Vec::new(),
            records: Vec::new(),
            known: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn blob_count(&self) -> usize {
        self.records.len()
    }

    /// Bytes buffered so far (blobs only, before index and footer).
    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Append a blob payload, returning its MAC and record.
    ///
    /// A second append of the same `(type, mac)` returns the first
    /// record unchanged.
    pub fn append(
        &mut self,
        ty: ResourceType,
        payload: &[u8],
    ) -> Result<(Mac, BlobRecord), Error> {
        if ty.is_container() {
            return Err(StoreError::Invalid(format!(
                "cannot store {} inside a packfile",
                ty
            ))
            .into());
        }

        let mac = content_mac(self.crypt.as_deref(), payload);

        if let Some(&at) = self.known.get(&(ty, mac)) {
            return Ok((mac, self.records[at].clone()));
        }

        let version = current_version(ty);
        let (framed, flags) =
            FramedResource::encode_blob(ty, version, payload, self.crypt.as_deref(), self.compress)?;

        let record = BlobRecord {
            resource_type: ty,
            version,
            mac,
            offset: self.buf.len() as u64,
            length: framed.raw_size(),
            flags,
        };

        self.buf.extend_from_slice(framed.raw_data());
        self.known.insert((ty, mac), self.records.len());
        self.records.push(record.clone());

        Ok((mac, record))
    }

    /// Write index and footer, then upload the packfile under its final
    /// MAC.
    pub fn seal(self, backend: &dyn Backend) -> Result<SealedPackfile, Error> {
        let mut data = self.buf;

        let index_offset = data.len() as u64;
        for record in &self.records {
            data.extend_from_slice(&record.to_bytes());
        }
        let index_length = data.len() as u64 - index_offset;

        let footer = PackfileFooter {
            footer_version: PACKFILE_FOOTER_VERSION_1,
            index_offset,
            index_length,
            blob_count: self.records.len() as u32,
            footer_mac: [0u8; 32],
        };

        // footer MAC covers everything up to the MAC field itself
        data.extend_from_slice(&footer.to_bytes()[0..PACKFILE_FOOTER_SIZE - 32]);
        let footer_mac = content_mac(self.crypt.as_deref(), &data);
        data.extend_from_slice(&footer_mac);

        let mac = content_mac(self.crypt.as_deref(), &data);
        retry_write("packfile upload", || {
            backend.put(Category::Packfile, &mac, &data)
        })?;

        Ok(SealedPackfile {
            mac,
            size: data.len() as u64,
            records: self.records,
        })
    }
}

/// Random-access reader over a sealed packfile.
///
/// Opening fetches only footer and index; blobs are served by single
/// ranged reads. The whole container is never downloaded except by
/// [`PackfileReader::verify`].
pub struct PackfileReader {
    backend: Arc<dyn Backend>,
    crypt: Option<Arc<RepositoryKey>>,
    mac: Mac,
    footer: PackfileFooter,
    index: Vec<BlobRecord>,
}

impl PackfileReader {
    pub fn open(
        backend: Arc<dyn Backend>,
        crypt: Option<Arc<RepositoryKey>>,
        mac: Mac,
    ) -> Result<Self, Error> {
        let tail = retry_read("packfile footer read", || {
            backend.get_tail(&mac, PACKFILE_FOOTER_SIZE as u64)
        })?;
        if tail.len() < PACKFILE_FOOTER_SIZE {
            return Err(StoreError::Corruption(format!(
                "packfile {} too small for a footer ({} bytes)",
                hex::encode(mac),
                tail.len()
            ))
            .into());
        }
        let footer = PackfileFooter::from_bytes(&tail)?;

        if footer.index_length as usize != footer.blob_count as usize * BLOB_RECORD_SIZE {
            return Err(StoreError::Corruption(format!(
                "packfile {} index length {} does not match {} blobs",
                hex::encode(mac),
                footer.index_length,
                footer.blob_count
            ))
            .into());
        }

        let raw_index = retry_read("packfile index read", || {
            backend.get_range(&mac, footer.index_offset, footer.index_length)
        })?;

        let mut index = Vec::with_capacity(footer.blob_count as usize);
        for chunk in raw_index.chunks(BLOB_RECORD_SIZE) {
            index.push(BlobRecord::from_bytes(chunk)?);
        }

        Ok(Self {
            backend,
            crypt,
            mac,
            footer,
            index,
        })
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    pub fn blob_count(&self) -> usize {
        self.index.len()
    }

    pub fn index(&self) -> impl Iterator<Item = &BlobRecord> {
        self.index.iter()
    }

    /// Read and decode the blob stored at `(offset, length)`.
    pub fn blob(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let record = self
            .index
            .iter()
            .find(|record| record.offset == offset && record.length == length)
            .ok_or_else(|| {
                StoreError::Invalid(format!(
                    "no blob at {}+{} in packfile {}",
                    offset,
                    length,
                    hex::encode(self.mac)
                ))
            })?
            .clone();

        self.read_record(&record)
    }

    /// Read and decode the blob a record describes, verifying both the
    /// envelope digest and the content MAC.
    pub fn read_record(&self, record: &BlobRecord) -> Result<Vec<u8>, Error> {
        let raw = retry_read("packfile blob read", || {
            self.backend
                .get_range(&self.mac, record.offset, record.length)
        })?;

        let framed = FramedResource::from_raw(raw)?;
        if framed.resource_type() != record.resource_type {
            return Err(StoreError::Corruption(format!(
                "blob type mismatch in packfile {} at offset {}",
                hex::encode(self.mac),
                record.offset
            ))
            .into());
        }

        let data = framed.decode(self.crypt.as_deref(), record.flags)?;
        verify_content(self.crypt.as_deref(), &data, &record.mac)?;
        Ok(data)
    }

    /// Download the complete packfile and verify packfile MAC, footer MAC
    /// and every blob.
    pub fn verify(&self) -> Result<(), Error> {
        let data = retry_read("packfile download", || {
            self.backend.get(Category::Packfile, &self.mac)
        })?;

        if content_mac(self.crypt.as_deref(), &data) != self.mac {
            return Err(StoreError::Integrity(format!(
                "packfile {} content does not match its MAC",
                hex::encode(self.mac)
            ))
            .into());
        }

        if data.len() < PACKFILE_FOOTER_SIZE {
            return Err(StoreError::Corruption("packfile shorter than footer".into()).into());
        }
        let hashed_len = data.len() - 32;
        let computed = content_mac(self.crypt.as_deref(), &data[..hashed_len]);
        if computed != self.footer.footer_mac {
            return Err(StoreError::Corruption(format!(
                "packfile {} footer MAC mismatch",
                hex::encode(self.mac)
            ))
            .into());
        }

        for record in &self.index {
            self.read_record(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MemoryBackend;

    fn memory() -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn build_and_read_back() -> Result<(), Error> {
        let backend = memory();

        let mut builder = PackfileBuilder::new(None, Some(1));
        let (mac_a, record_a) = builder.append(ResourceType::Chunk, b"first blob")?;
        let (mac_b, _) = builder.append(ResourceType::Object, b"second blob")?;
        assert_ne!(mac_a, mac_b);
        assert_eq!(record_a.offset, 0);

        let sealed = builder.seal(backend.as_ref())?;
        assert_eq!(sealed.records.len(), 2);

        let reader = PackfileReader::open(backend, None, sealed.mac)?;
        assert_eq!(reader.blob_count(), 2);

        for record in sealed.records {
            let data = reader.read_record(&record)?;
            assert_eq!(content_mac(None, &data), record.mac);
        }
        Ok(())
    }

    #[test]
    fn duplicate_append_dedupes() -> Result<(), Error> {
        let mut builder = PackfileBuilder::new(None, None);
        let (mac_a, record_a) = builder.append(ResourceType::Chunk, b"same")?;
        let size_after_first = builder.size();
        let (mac_b, record_b) = builder.append(ResourceType::Chunk, b"same")?;

        assert_eq!(mac_a, mac_b);
        assert_eq!(record_a, record_b);
        assert_eq!(builder.size(), size_after_first);
        assert_eq!(builder.blob_count(), 1);
        Ok(())
    }

    #[test]
    fn single_blob_packfile_self_consistent() -> Result<(), Error> {
        let backend = memory();

        let mut builder = PackfileBuilder::new(None, Some(1));
        builder.append(ResourceType::Chunk, b"lonely")?;
        let sealed = builder.seal(backend.as_ref())?;

        let reader = PackfileReader::open(backend, None, sealed.mac)?;
        reader.verify()?;

        let record = reader.index().next().unwrap().clone();
        assert_eq!(reader.blob(record.offset, record.length)?, b"lonely");
        Ok(())
    }

    #[test]
    fn zero_length_blob() -> Result<(), Error> {
        let backend = memory();

        let mut builder = PackfileBuilder::new(None, Some(1));
        let (mac, _) = builder.append(ResourceType::Chunk, b"")?;
        assert_eq!(mac, content_mac(None, b""));

        let sealed = builder.seal(backend.as_ref())?;
        let reader = PackfileReader::open(backend, None, sealed.mac)?;
        let record = reader.index().next().unwrap().clone();
        assert_eq!(reader.read_record(&record)?, b"");
        Ok(())
    }

    #[test]
    fn containers_are_refused() {
        let mut builder = PackfileBuilder::new(None, None);
        assert!(builder.append(ResourceType::State, b"x").is_err());
        assert!(builder.append(ResourceType::Packfile, b"x").is_err());
    }

    #[test]
    fn truncated_footer_is_corruption() -> Result<(), Error> {
        let backend = memory();
        backend.put(Category::Packfile, &[1u8; 32], b"tiny")?;

        let err = PackfileReader::open(backend, None, [1u8; 32]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn encrypted_packfile_roundtrip() -> Result<(), Error> {
        let backend = memory();
        let crypt = Arc::new(RepositoryKey::new([9u8; 32])?);

        let mut builder = PackfileBuilder::new(Some(crypt.clone()), Some(1));
        let (mac, _) = builder.append(ResourceType::Chunk, b"secret payload")?;
        // keyed digests differ from the plain hash
        assert_ne!(mac, content_mac(None, b"secret payload"));

        let sealed = builder.seal(backend.as_ref())?;
        let reader = PackfileReader::open(backend, Some(crypt), sealed.mac)?;
        reader.verify()?;

        let record = reader.index().next().unwrap().clone();
        assert_eq!(reader.read_record(&record)?, b"secret payload");
        Ok(())
    }
}
