//! The uniform envelope every persisted resource is wrapped in.
//!
//! One code path frames containers (packfiles, states, locks, the config)
//! and blobs alike: `header | processed payload | digest`. The payload is
//! optionally zstd compressed, then optionally AEAD encrypted; the trailer
//! digest covers `(resource-type, version, stored payload)` and is keyed
//! when the repository is encrypted.
//!
//! Two digests exist per blob and must not be confused: the envelope
//! digest protects the stored bytes (mismatch is `Corruption`), while the
//! content MAC addresses the plaintext (mismatch is `Integrity`).

use anyhow::{format_err, Error};

use silo_api_types::{version_supported, Mac, ResourceType, ResourceVersion};
use silo_tools::RepositoryKey;

use crate::error::StoreError;
use crate::file_formats::*;

/// Compute the identity MAC of a payload.
///
/// Keyed via the repository key when encryption is enabled, so digests
/// of different repositories do not clash; plain SHA256 otherwise.
pub fn content_mac(key: Option<&RepositoryKey>, data: &[u8]) -> Mac {
    match key {
        Some(key) => key.content_digest(data),
        None => openssl::sha::sha256(data),
    }
}

/// Verify a payload against its identity MAC.
pub fn verify_content(
    key: Option<&RepositoryKey>,
    data: &[u8],
    expected: &Mac,
) -> Result<(), Error> {
    if &content_mac(key, data) != expected {
        return Err(StoreError::Integrity("content MAC mismatch".to_string()).into());
    }
    Ok(())
}

fn compute_frame_digest(
    key: Option<&RepositoryKey>,
    resource_type: ResourceType,
    version: ResourceVersion,
    stored_payload: &[u8],
) -> Result<Mac, Error> {
    let ty = resource_type.as_u32().to_le_bytes();
    let ver = version.as_u32().to_le_bytes();

    match key {
        Some(key) => key.authenticate(&[&ty[..], &ver[..], stored_payload]),
        None => {
            let mut hasher = openssl::sha::Sha256::new();
            hasher.update(&ty);
            hasher.update(&ver);
            hasher.update(stored_payload);
            Ok(hasher.finish())
        }
    }
}

/// A complete framed resource as stored by a backend or inside a packfile.
pub struct FramedResource {
    raw: Vec<u8>, // header, processed payload, trailer digest
}

impl FramedResource {
    /// accessor to the raw framed bytes
    pub fn raw_data(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the framed size
    pub fn raw_size(&self) -> u64 {
        self.raw.len() as u64
    }

    /// Consume self and return the framed bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.raw
    }

    pub fn resource_type(&self) -> ResourceType {
        // raw was validated on construction
        let tag = u32::from_le_bytes(self.raw[4..8].try_into().unwrap());
        ResourceType::from_u32(tag).unwrap()
    }

    pub fn version(&self) -> ResourceVersion {
        let raw = u32::from_le_bytes(self.raw[8..12].try_into().unwrap());
        ResourceVersion::from_u32(raw).unwrap()
    }

    fn stored_payload(&self) -> &[u8] {
        &self.raw[RESOURCE_HEADER_SIZE..self.raw.len() - RESOURCE_TRAILER_SIZE]
    }

    fn trailer_digest(&self) -> Mac {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&self.raw[self.raw.len() - RESOURCE_TRAILER_SIZE..]);
        digest
    }

    /// Frame a container payload with the deterministic pipeline.
    ///
    /// Containers carry no flags, so compression and encryption are
    /// applied exactly as configured, never opportunistically.
    pub fn encode(
        resource_type: ResourceType,
        version: ResourceVersion,
        data: &[u8],
        key: Option<&RepositoryKey>,
        compress: Option<i32>,
    ) -> Result<Self, Error> {
        let processed = match compress {
            Some(level) => zstd::bulk::compress(data, level)?,
            None => data.to_vec(),
        };
        Self::build(resource_type, version, processed, key)
    }

    /// Frame a blob payload.
    ///
    /// Compression is only kept when the result is shorter; the flags
    /// describing what was actually applied are returned for the packfile
    /// index.
    pub fn encode_blob(
        resource_type: ResourceType,
        version: ResourceVersion,
        data: &[u8],
        key: Option<&RepositoryKey>,
        compress: Option<i32>,
    ) -> Result<(Self, BlobFlags), Error> {
        let mut flags = BlobFlags::empty();
        let processed = match compress {
            Some(level) => {
                let compressed = zstd::bulk::compress(data, level)?;
                // Note: We only use compression if the result is shorter
                if compressed.len() < data.len() {
                    flags |= BlobFlags::COMPRESSED;
                    compressed
                } else {
                    data.to_vec()
                }
            }
            None => data.to_vec(),
        };
        let framed = Self::build(resource_type, version, processed, key)?;
        if key.is_some() {
            flags |= BlobFlags::ENCRYPTED;
        }
        Ok((framed, flags))
    }

    fn build(
        resource_type: ResourceType,
        version: ResourceVersion,
        processed: Vec<u8>,
        key: Option<&RepositoryKey>,
    ) -> Result<Self, Error> {
        if processed.len() > MAX_PAYLOAD_SIZE {
            return Err(StoreError::Invalid(format!(
                "payload too large ({} bytes)",
                processed.len()
            ))
            .into());
        }

        let stored = match key {
            Some(key) => key.seal(&processed)?,
            None => processed,
        };

        let header = ResourceHeader {
            resource_type,
            version,
            payload_len: stored.len() as u64,
        };

        let digest = compute_frame_digest(key, resource_type, version, &stored)?;

        let mut raw =
            Vec::with_capacity(RESOURCE_HEADER_SIZE + stored.len() + RESOURCE_TRAILER_SIZE);
        raw.extend_from_slice(&header.to_bytes());
        raw.extend_from_slice(&stored);
        raw.extend_from_slice(&digest);

        Ok(Self { raw })
    }

    /// Create an instance from raw framed bytes.
    ///
    /// Validates the header, the payload length and the version; the
    /// trailer digest is checked separately by [`Self::verify_frame`] or
    /// as part of [`Self::decode`].
    pub fn from_raw(raw: Vec<u8>) -> Result<Self, Error> {
        if raw.len() < RESOURCE_HEADER_SIZE + RESOURCE_TRAILER_SIZE {
            return Err(
                StoreError::Corruption(format!("framed resource too small ({} bytes)", raw.len()))
                    .into(),
            );
        }

        let header = ResourceHeader::from_bytes(&raw)?;

        let expected = RESOURCE_HEADER_SIZE + header.payload_len as usize + RESOURCE_TRAILER_SIZE;
        if raw.len() != expected {
            return Err(StoreError::Corruption(format!(
                "framed resource length mismatch ({} != {})",
                raw.len(),
                expected
            ))
            .into());
        }

        if !version_supported(header.resource_type, header.version) {
            return Err(StoreError::BadVersion {
                ty: header.resource_type,
                version: header.version,
            }
            .into());
        }

        Ok(Self { raw })
    }

    /// Verify the trailer digest against the header and stored payload.
    pub fn verify_frame(&self, key: Option<&RepositoryKey>) -> Result<(), Error> {
        let computed = compute_frame_digest(
            key,
            self.resource_type(),
            self.version(),
            self.stored_payload(),
        )?;
        if computed != self.trailer_digest() {
            return Err(StoreError::Corruption(format!(
                "envelope digest mismatch for {} resource",
                self.resource_type()
            ))
            .into());
        }
        Ok(())
    }

    /// Verify and decode the payload back to plaintext.
    pub fn decode(&self, key: Option<&RepositoryKey>, flags: BlobFlags) -> Result<Vec<u8>, Error> {
        self.verify_frame(key)?;

        let stored = self.stored_payload();

        let processed = if flags.contains(BlobFlags::ENCRYPTED) {
            let key = key.ok_or_else(|| {
                format_err!("unable to decrypt {} - no key loaded", self.resource_type())
            })?;
            key.open(stored)
                .map_err(|err| StoreError::Corruption(err.to_string()))?
        } else {
            stored.to_vec()
        };

        if flags.contains(BlobFlags::COMPRESSED) {
            let mut reader = &processed[..];
            let data = zstd::stream::decode_all(&mut reader)
                .map_err(|err| StoreError::Corruption(format!("zstd decode failed - {}", err)))?;
            if data.len() > MAX_PAYLOAD_SIZE {
                return Err(StoreError::Corruption("decompressed payload too large".into()).into());
            }
            Ok(data)
        } else {
            Ok(processed)
        }
    }

    /// Decode a container framed by [`Self::encode`].
    pub fn decode_container(
        &self,
        key: Option<&RepositoryKey>,
        compressed: bool,
    ) -> Result<Vec<u8>, Error> {
        let mut flags = BlobFlags::empty();
        if compressed {
            flags |= BlobFlags::COMPRESSED;
        }
        if key.is_some() {
            flags |= BlobFlags::ENCRYPTED;
        }
        self.decode(key, flags)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_api_types::current_version;

    fn version() -> ResourceVersion {
        current_version(ResourceType::Chunk)
    }

    #[test]
    fn plain_roundtrip() -> Result<(), Error> {
        let data = b"hello framing".to_vec();
        let framed =
            FramedResource::encode(ResourceType::Chunk, version(), &data, None, None)?;

        assert_eq!(&framed.raw_data()[0..4], &RESOURCE_MAGIC_1_0);
        assert_eq!(framed.resource_type(), ResourceType::Chunk);

        let back = FramedResource::from_raw(framed.raw_data().to_vec())?;
        assert_eq!(back.decode(None, BlobFlags::empty())?, data);
        Ok(())
    }

    #[test]
    fn empty_payload_has_fixed_mac() -> Result<(), Error> {
        let framed =
            FramedResource::encode(ResourceType::Chunk, version(), b"", None, None)?;
        let back = FramedResource::from_raw(framed.into_inner())?;
        assert_eq!(back.decode(None, BlobFlags::empty())?, b"");

        // sha256 of the empty string, the well-known constant
        assert_eq!(
            hex::encode(content_mac(None, b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        Ok(())
    }

    #[test]
    fn corruption_is_detected() -> Result<(), Error> {
        let framed = FramedResource::encode(
            ResourceType::State,
            current_version(ResourceType::State),
            b"some state payload",
            None,
            None,
        )?;
        let mut raw = framed.into_inner();
        let len = raw.len();
        raw[len - RESOURCE_TRAILER_SIZE - 1] ^= 0x01; // flip a payload bit

        let framed = FramedResource::from_raw(raw)?;
        let err = framed.verify_frame(None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn unknown_major_is_refused() -> Result<(), Error> {
        let framed = FramedResource::encode(
            ResourceType::Chunk,
            ResourceVersion::new(9, 0, 0),
            b"x",
            None,
            None,
        )?;
        let err = FramedResource::from_raw(framed.into_inner()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::BadVersion { .. })
        ));
        Ok(())
    }

    #[test]
    fn encrypted_roundtrip() -> Result<(), Error> {
        let key = RepositoryKey::new([3u8; 32])?;
        let data = vec![0x42u8; 4096];

        let (framed, flags) = FramedResource::encode_blob(
            ResourceType::Chunk,
            version(),
            &data,
            Some(&key),
            Some(1),
        )?;
        assert!(flags.contains(BlobFlags::ENCRYPTED));
        assert!(flags.contains(BlobFlags::COMPRESSED));

        let back = FramedResource::from_raw(framed.into_inner())?;
        assert_eq!(back.decode(Some(&key), flags)?, data);

        // decoding with the wrong key fails
        let wrong = RepositoryKey::new([4u8; 32])?;
        assert!(back.decode(Some(&wrong), flags).is_err());
        Ok(())
    }

    #[test]
    fn incompressible_blob_stays_uncompressed() -> Result<(), Error> {
        // high entropy payload, zstd cannot win
        let mut data = vec![0u8; 1024];
        openssl::rand::rand_bytes(&mut data)?;

        let (framed, flags) =
            FramedResource::encode_blob(ResourceType::Chunk, version(), &data, None, Some(1))?;
        assert!(!flags.contains(BlobFlags::COMPRESSED));
        assert_eq!(framed.decode(None, flags)?, data);
        Ok(())
    }
}
