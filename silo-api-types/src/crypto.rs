use std::fmt;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

/// Whether repository payloads pass through the AEAD pipeline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptMode {
    /// Payloads are stored as the compressor produced them.
    None,
    /// Payloads are sealed with the repository key.
    Encrypt,
}

impl Default for CryptMode {
    fn default() -> Self {
        CryptMode::None
    }
}

/// Identifies an encryption key without revealing anything about it.
///
/// Stored in the repository config and compared on open; persisted and
/// parsed as 64 hex characters, rendered as a short id in messages.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Fingerprint {
    #[serde(with = "hex::serde")]
    bytes: [u8; 32],
}

impl Fingerprint {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// First four bytes in hex, enough to tell keys apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| format_err!("'{}' is not a key fingerprint", s))?;
        Ok(Self { bytes })
    }
}
