use anyhow::Error;
use bitflags::bitflags;

use silo_api_types::{Mac, ResourceType, ResourceVersion, MAC_SIZE};

use crate::error::StoreError;

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

/// Fixed envelope magic, first four bytes of every framed resource.
pub const RESOURCE_MAGIC_1_0: [u8; 4] = [181, 7, 155, 30];

/// Envelope header: magic, resource type, version, payload length.
pub const RESOURCE_HEADER_SIZE: usize = 20;

/// Envelope trailer: the 32 byte digest.
pub const RESOURCE_TRAILER_SIZE: usize = MAC_SIZE;

/// Refuse anything larger during encode and decode.
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024 * 1024;

/// Decoded form of the fixed-size envelope header.
///
/// ```text
/// offset  0: magic (4 bytes)
/// offset  4: resource-type (u32 LE)
/// offset  8: version (u32 LE, major<<16 | minor<<8 | patch)
/// offset 12: payload-length (u64 LE)
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ResourceHeader {
    pub resource_type: ResourceType,
    pub version: ResourceVersion,
    pub payload_len: u64,
}

impl ResourceHeader {
    pub fn to_bytes(&self) -> [u8; RESOURCE_HEADER_SIZE] {
        let mut buf = [0u8; RESOURCE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&RESOURCE_MAGIC_1_0);
        buf[4..8].copy_from_slice(&self.resource_type.as_u32().to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.as_u32().to_le_bytes());
        buf[12..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < RESOURCE_HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "resource header too small ({} bytes)",
                data.len()
            ))
            .into());
        }
        if data[0..4] != RESOURCE_MAGIC_1_0 {
            return Err(StoreError::Corruption("wrong envelope magic".to_string()).into());
        }

        let raw_type = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let resource_type = ResourceType::from_u32(raw_type)
            .map_err(|err| StoreError::Corruption(err.to_string()))?;

        let raw_version = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let version = ResourceVersion::from_u32(raw_version)
            .map_err(|err| StoreError::Corruption(err.to_string()))?;

        let payload_len = u64::from_le_bytes(data[12..20].try_into().unwrap());

        Ok(Self {
            resource_type,
            version,
            payload_len,
        })
    }
}

bitflags! {
    /// Per-blob options recorded in the packfile index.
    pub struct BlobFlags: u32 {
        /// Payload is zstd compressed.
        const COMPRESSED = 0b0000_0001;
        /// Payload is AEAD encrypted (iv/tag prefix present).
        const ENCRYPTED  = 0b0000_0010;
    }
}

/// One packfile index entry, fixed 60 bytes on disk.
///
/// ```text
/// offset  0: resource-type (u32 LE)
/// offset  4: version (u32 LE)
/// offset  8: mac (32 bytes)
/// offset 40: offset (u64 LE)
/// offset 48: length (u64 LE)
/// offset 56: flags (u32 LE)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRecord {
    pub resource_type: ResourceType,
    pub version: ResourceVersion,
    pub mac: Mac,
    pub offset: u64,
    pub length: u64,
    pub flags: BlobFlags,
}

pub const BLOB_RECORD_SIZE: usize = 60;

impl BlobRecord {
    pub fn to_bytes(&self) -> [u8; BLOB_RECORD_SIZE] {
        let mut buf = [0u8; BLOB_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.resource_type.as_u32().to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.as_u32().to_le_bytes());
        buf[8..40].copy_from_slice(&self.mac);
        buf[40..48].copy_from_slice(&self.offset.to_le_bytes());
        buf[48..56].copy_from_slice(&self.length.to_le_bytes());
        buf[56..60].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < BLOB_RECORD_SIZE {
            return Err(StoreError::Corruption(format!(
                "blob record too small ({} bytes)",
                data.len()
            ))
            .into());
        }

        let resource_type =
            ResourceType::from_u32(u32::from_le_bytes(data[0..4].try_into().unwrap()))
                .map_err(|err| StoreError::Corruption(err.to_string()))?;
        let version = ResourceVersion::from_u32(u32::from_le_bytes(data[4..8].try_into().unwrap()))
            .map_err(|err| StoreError::Corruption(err.to_string()))?;

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&data[8..40]);

        let offset = u64::from_le_bytes(data[40..48].try_into().unwrap());
        let length = u64::from_le_bytes(data[48..56].try_into().unwrap());
        let raw_flags = u32::from_le_bytes(data[56..60].try_into().unwrap());
        let flags = BlobFlags::from_bits(raw_flags).ok_or_else(|| {
            StoreError::Corruption(format!("unknown blob flags {:#x}", raw_flags))
        })?;

        Ok(Self {
            resource_type,
            version,
            mac,
            offset,
            length,
            flags,
        })
    }
}

/// Current packfile footer layout version.
pub const PACKFILE_FOOTER_VERSION_1: u32 = 1;

/// Fixed footer size, so one ranged tail read recovers it.
pub const PACKFILE_FOOTER_SIZE: usize = 56;

/// Trailing packfile footer.
///
/// ```text
/// offset  0: footer-version (u32 LE)
/// offset  4: index-offset (u64 LE)
/// offset 12: index-length (u64 LE)
/// offset 20: blob-count (u32 LE)
/// offset 24: footer-mac (32 bytes, over [0 .. footer-mac))
/// ```
#[derive(Clone, Copy, Debug)]
pub struct PackfileFooter {
    pub footer_version: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub blob_count: u32,
    pub footer_mac: Mac,
}

impl PackfileFooter {
    pub fn to_bytes(&self) -> [u8; PACKFILE_FOOTER_SIZE] {
        let mut buf = [0u8; PACKFILE_FOOTER_SIZE];
        buf[0..4].copy_from_slice(&self.footer_version.to_le_bytes());
        buf[4..12].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.index_length.to_le_bytes());
        buf[20..24].copy_from_slice(&self.blob_count.to_le_bytes());
        buf[24..56].copy_from_slice(&self.footer_mac);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < PACKFILE_FOOTER_SIZE {
            return Err(StoreError::Corruption(format!(
                "truncated packfile footer ({} bytes)",
                data.len()
            ))
            .into());
        }

        let footer_version = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if footer_version != PACKFILE_FOOTER_VERSION_1 {
            return Err(StoreError::Corruption(format!(
                "unknown packfile footer version {}",
                footer_version
            ))
            .into());
        }

        let mut footer_mac = [0u8; MAC_SIZE];
        footer_mac.copy_from_slice(&data[24..56]);

        Ok(Self {
            footer_version,
            index_offset: u64::from_le_bytes(data[4..12].try_into().unwrap()),
            index_length: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            blob_count: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            footer_mac,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = ResourceHeader {
            resource_type: ResourceType::Chunk,
            version: ResourceVersion::new(1, 0, 2),
            payload_len: 12345,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), RESOURCE_HEADER_SIZE);

        let back = ResourceHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.resource_type, ResourceType::Chunk);
        assert_eq!(back.version, ResourceVersion::new(1, 0, 2));
        assert_eq!(back.payload_len, 12345);
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let header = ResourceHeader {
            resource_type: ResourceType::Chunk,
            version: ResourceVersion::new(1, 0, 0),
            payload_len: 0,
        };
        let mut bytes = header.to_bytes();
        bytes[0] ^= 0xff;
        assert!(ResourceHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn blob_record_roundtrip() {
        let record = BlobRecord {
            resource_type: ResourceType::Object,
            version: ResourceVersion::new(1, 0, 0),
            mac: [0x5a; 32],
            offset: 99,
            length: 1000,
            flags: BlobFlags::COMPRESSED,
        };
        let back = BlobRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn footer_roundtrip() {
        let footer = PackfileFooter {
            footer_version: PACKFILE_FOOTER_VERSION_1,
            index_offset: 4096,
            index_length: 120,
            blob_count: 2,
            footer_mac: [9u8; 32],
        };
        let back = PackfileFooter::from_bytes(&footer.to_bytes()).unwrap();
        assert_eq!(back.index_offset, 4096);
        assert_eq!(back.index_length, 120);
        assert_eq!(back.blob_count, 2);
        assert_eq!(back.footer_mac, [9u8; 32]);
    }
}
