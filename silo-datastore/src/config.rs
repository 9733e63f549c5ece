//! The one-time repository configuration.
//!
//! Created together with the repository, stored framed but always plain
//! (it carries everything needed to bootstrap the pipeline, including
//! the KDF parameters and the passphrase canary).

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{current_version, CryptMode, Fingerprint, ResourceType};
use silo_key_config::{KeyCanary, KeyDerivationConfig};

use crate::resource::FramedResource;

/// Default packfile size bound.
pub const DEFAULT_PACKFILE_MAX_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: 1,
        }
    }
}

impl CompressionConfig {
    /// Level to hand to the framing pipeline, `None` when disabled.
    pub fn zstd_level(&self) -> Option<i32> {
        match self.algorithm {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zstd => Some(self.level),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherAlgorithm {
    Aes256Gcm,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionConfig {
    pub algorithm: CipherAlgorithm,
    pub kdf: KeyDerivationConfig,
    /// Lets `open` verify a passphrase without exposing the key.
    pub canary: KeyCanary,
    /// Fingerprint of the derived key.
    pub fingerprint: Fingerprint,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackfilePolicy {
    /// `None` means unbounded (single-packfile archives are legal).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_size: Option<u64>,
}

impl Default for PackfilePolicy {
    fn default() -> Self {
        Self {
            max_size: Some(DEFAULT_PACKFILE_MAX_SIZE),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryConfig {
    /// Random repository identity, fixed at creation.
    pub uuid: String,
    /// Envelope layout generation.
    pub framing_version: u32,
    pub hash: HashAlgorithm,
    pub compression: CompressionConfig,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encryption: Option<EncryptionConfig>,
    pub packfile: PackfilePolicy,
}

pub const FRAMING_VERSION_1: u32 = 1;

impl RepositoryConfig {
    pub fn new(
        compression: CompressionConfig,
        encryption: Option<EncryptionConfig>,
        max_size: Option<u64>,
    ) -> Result<Self, Error> {
        let mut id = [0u8; 16];
        openssl::rand::rand_bytes(&mut id)?;

        Ok(Self {
            uuid: hex::encode(id),
            framing_version: FRAMING_VERSION_1,
            hash: HashAlgorithm::Sha256,
            compression,
            encryption,
            packfile: PackfilePolicy { max_size },
        })
    }

    pub fn crypt_mode(&self) -> CryptMode {
        if self.encryption.is_some() {
            CryptMode::Encrypt
        } else {
            CryptMode::None
        }
    }

    /// Frame for storage as the CONFIG resource.
    pub fn seal(&self) -> Result<Vec<u8>, Error> {
        let payload = serde_json::to_vec_pretty(self)?;
        let framed = FramedResource::encode(
            ResourceType::Config,
            current_version(ResourceType::Config),
            &payload,
            None,
            None,
        )?;
        Ok(framed.into_inner())
    }

    /// Parse the framed CONFIG resource.
    pub fn parse(raw: Vec<u8>) -> Result<Self, Error> {
        let framed = FramedResource::from_raw(raw)?;
        if framed.resource_type() != ResourceType::Config {
            bail!("expected a config resource, got {}", framed.resource_type());
        }
        let payload = framed.decode_container(None, false)?;
        let config: RepositoryConfig = serde_json::from_slice(&payload)?;

        if config.framing_version != FRAMING_VERSION_1 {
            bail!(
                "unsupported repository framing version {}",
                config.framing_version
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seal_parse_roundtrip() -> Result<(), Error> {
        let config = RepositoryConfig::new(CompressionConfig::default(), None, Some(8 << 20))?;
        let raw = config.seal()?;
        let parsed = RepositoryConfig::parse(raw)?;

        assert_eq!(parsed.uuid, config.uuid);
        assert_eq!(parsed.packfile.max_size, Some(8 << 20));
        assert!(parsed.encryption.is_none());
        assert_eq!(parsed.crypt_mode(), CryptMode::None);
        assert_eq!(parsed.compression.zstd_level(), Some(1));
        Ok(())
    }

    #[test]
    fn unbounded_packfiles_are_legal() -> Result<(), Error> {
        let config = RepositoryConfig::new(CompressionConfig::default(), None, None)?;
        let parsed = RepositoryConfig::parse(config.seal()?)?;
        assert_eq!(parsed.packfile.max_size, None);
        Ok(())
    }
}
