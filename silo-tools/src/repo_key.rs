//! The repository key and the primitives derived from it.
//!
//! Everything an encrypted repository addresses, authenticates or seals
//! goes through this type:
//!
//! * identity digests of plaintext payloads, salted into a per-key
//!   namespace so addresses from different keys never collide,
//! * envelope digests (HMAC-SHA256) over the parts of a framed
//!   resource,
//! * AEAD sealing of processed payloads.
//!
//! A sealed buffer is self-contained: `iv | tag | ciphertext`, with
//! AES-256-GCM doing the work. Callers never see ivs, tags or cipher
//! handles.

use anyhow::{bail, format_err, Error};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};

const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 16;

/// Bytes a sealed buffer carries on top of its ciphertext.
pub const SEAL_OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// Digesting this fixed input yields the key fingerprint.
const FINGERPRINT_INPUT: [u8; 32] = [
    43, 175, 16, 88, 202, 9, 230, 57, 141, 78, 191, 4, 244, 120, 167, 95, 29, 210, 63, 148, 101,
    12, 224, 73, 186, 50, 135, 98, 251, 34, 219, 66,
];

pub struct RepositoryKey {
    enc_key: [u8; 32],
    // salt appended to every identity digest; derived from the key,
    // never stored
    digest_salt: [u8; 32],
    hmac_key: PKey<Private>,
}

impl RepositoryKey {
    pub fn new(enc_key: [u8; 32]) -> Result<Self, Error> {
        let mut digest_salt = [0u8; 32];
        openssl::pkcs5::pbkdf2_hmac(
            &enc_key,
            b"silo digest namespace",
            32,
            MessageDigest::sha256(),
            &mut digest_salt,
        )?;

        let hmac_key = PKey::hmac(&digest_salt)?;

        Ok(Self {
            enc_key,
            digest_salt,
            hmac_key,
        })
    }

    /// Identity digest of a plaintext payload.
    ///
    /// SHA-256 over the payload followed by the key-derived salt. The
    /// trailing position rules out length extension; the salt itself
    /// keeps digests from being comparable across keys, so an observer
    /// of two encrypted repositories cannot correlate their contents.
    pub fn content_digest(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(data);
        hasher.update(&self.digest_salt);
        hasher.finish()
    }

    /// HMAC-SHA256 over the concatenation of `parts`.
    ///
    /// Used as the envelope digest of framed resources; the parts are
    /// the envelope fields followed by the stored payload.
    pub fn authenticate(&self, parts: &[&[u8]]) -> Result<[u8; 32], Error> {
        let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), &self.hmac_key)?;
        for part in parts {
            signer.update(part)?;
        }
        let mut digest = [0u8; 32];
        signer.sign(&mut digest)?;
        Ok(digest)
    }

    /// Identifies the key without revealing anything about it.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.content_digest(&FINGERPRINT_INPUT)
    }

    /// Seal a payload under a fresh random iv.
    ///
    /// Returns the self-contained `iv | tag | ciphertext` buffer that
    /// lands in the stored payload of an encrypted framed resource.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut sealed = vec![0u8; SEAL_OVERHEAD];
        openssl::rand::rand_bytes(&mut sealed[..IV_SIZE])?;

        let mut tag = [0u8; TAG_SIZE];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.enc_key,
            Some(&sealed[..IV_SIZE]),
            b"",
            plaintext,
            &mut tag,
        )?;

        sealed[IV_SIZE..SEAL_OVERHEAD].copy_from_slice(&tag);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed buffer, failing on truncation or tampering.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < SEAL_OVERHEAD {
            bail!("sealed payload truncated ({} bytes)", sealed.len());
        }
        let (iv, rest) = sealed.split_at(IV_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        decrypt_aead(
            Cipher::aes_256_gcm(),
            &self.enc_key,
            Some(iv),
            b"",
            ciphertext,
            tag,
        )
        .map_err(|_| format_err!("sealed payload does not authenticate"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seal_open_roundtrip() -> Result<(), Error> {
        let key = RepositoryKey::new([1u8; 32])?;

        let sealed = key.seal(b"framed payload bytes")?;
        assert_eq!(sealed.len(), SEAL_OVERHEAD + 20);
        assert_eq!(key.open(&sealed)?, b"framed payload bytes");

        // sealing twice produces different buffers (fresh iv)
        assert_ne!(sealed, key.seal(b"framed payload bytes")?);
        Ok(())
    }

    #[test]
    fn tampering_and_truncation_fail() -> Result<(), Error> {
        let key = RepositoryKey::new([1u8; 32])?;
        let mut sealed = key.seal(b"payload")?;

        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(key.open(&sealed).is_err());

        assert!(key.open(&sealed[..SEAL_OVERHEAD - 1]).is_err());
        assert!(key.open(b"").is_err());
        Ok(())
    }

    #[test]
    fn wrong_key_does_not_open() -> Result<(), Error> {
        let sealed = RepositoryKey::new([1u8; 32])?.seal(b"secret")?;
        assert!(RepositoryKey::new([2u8; 32])?.open(&sealed).is_err());
        Ok(())
    }

    #[test]
    fn digests_live_in_a_per_key_namespace() -> Result<(), Error> {
        let a = RepositoryKey::new([1u8; 32])?;
        let b = RepositoryKey::new([2u8; 32])?;

        assert_eq!(a.content_digest(b"x"), a.content_digest(b"x"));
        assert_ne!(a.content_digest(b"x"), b.content_digest(b"x"));
        assert_ne!(a.fingerprint(), b.fingerprint());

        assert_ne!(a.authenticate(&[&b"x"[..]])?, b.authenticate(&[&b"x"[..]])?);
        // part boundaries do not matter, only the concatenation
        assert_eq!(
            a.authenticate(&[&b"ab"[..], &b"c"[..]])?,
            a.authenticate(&[&b"a"[..], &b"bc"[..]])?,
        );
        Ok(())
    }
}
