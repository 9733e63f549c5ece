//! Passphrase handling for encrypted repositories.
//!
//! The repository secret is never stored. A key derivation function turns
//! the passphrase into the 32 byte repository key; a small canary
//! (authenticated encryption over a fixed plaintext) is kept in the
//! repository config so a passphrase can be verified on open without
//! exposing the key itself.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use silo_tools::RepositoryKey;

/// Key derivation function for passphrase protected repositories.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kdf {
    /// Derive the key with a password using SCrypt.
    Scrypt,
    /// Derive the key with a password using PBKDF2.
    PBKDF2,
}

impl Default for Kdf {
    #[inline]
    fn default() -> Self {
        Kdf::Scrypt
    }
}

#[derive(Clone, Deserialize, Serialize, Debug)]
pub enum KeyDerivationConfig {
    Scrypt {
        n: u64,
        r: u64,
        p: u64,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
    PBKDF2 {
        iter: usize,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
}

impl KeyDerivationConfig {
    /// Create a fresh configuration with a random salt.
    pub fn generate(kdf: Kdf) -> Result<Self, Error> {
        let mut salt = vec![0u8; 32];
        openssl::rand::rand_bytes(&mut salt)?;

        Ok(match kdf {
            Kdf::Scrypt => KeyDerivationConfig::Scrypt {
                n: 65536,
                r: 8,
                p: 1,
                salt,
            },
            Kdf::PBKDF2 => KeyDerivationConfig::PBKDF2 { iter: 65535, salt },
        })
    }

    /// Derive a key from the provided passphrase
    pub fn derive_key(&self, passphrase: &[u8]) -> Result<[u8; 32], Error> {
        let mut key = [0u8; 32];

        match self {
            KeyDerivationConfig::Scrypt { n, r, p, salt } => {
                // estimated scrypt memory usage is 128*r*n*p
                openssl::pkcs5::scrypt(passphrase, salt, *n, *r, *p, 1025 * 1024 * 1024, &mut key)?;

                Ok(key)
            }
            KeyDerivationConfig::PBKDF2 { iter, salt } => {
                openssl::pkcs5::pbkdf2_hmac(
                    passphrase,
                    salt,
                    *iter,
                    openssl::hash::MessageDigest::sha256(),
                    &mut key,
                )?;

                Ok(key)
            }
        }
    }
}

/// Fixed plaintext the canary seals. The value itself carries no
/// secret, it only has to be stable.
const CANARY_PLAINTEXT: &[u8] = b"silo repository key canary v1";

/// Passphrase verification data stored in the repository config: the
/// fixed plaintext, sealed under the derived key.
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct KeyCanary {
    #[serde(with = "bytes_as_base64")]
    pub data: Vec<u8>,
}

impl KeyCanary {
    /// Create the canary for a freshly derived key.
    pub fn create(key: &RepositoryKey) -> Result<Self, Error> {
        Ok(Self {
            data: key.seal(CANARY_PLAINTEXT)?,
        })
    }

    /// Verify that the derived key matches the one the canary was
    /// created with. Fails on a wrong passphrase.
    pub fn verify(&self, key: &RepositoryKey) -> Result<(), Error> {
        match key.open(&self.data) {
            Ok(plain) if plain == CANARY_PLAINTEXT => Ok(()),
            _ => bail!("wrong passphrase - canary verification failed"),
        }
    }
}

pub mod bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::decode(s).map_err(serde::de::Error::custom)
    }
}
