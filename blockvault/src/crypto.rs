//! Key derivation shared by the integrity layer's HMAC tag and the
//! encryption layer's per-block AEAD subkeys (§4.6, §4.7). A single
//! Argon2id pass turns the archive password into a 32-byte master key;
//! everything derived from it afterwards is a cheap HKDF-SHA256 expand
//! keyed by a domain-separation label.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::config::CryptoConfig;
use crate::error::{Error, Result};

/// Fixed Argon2id salt for master-key derivation. The master key must be
/// reproducible from the password alone (§4.7), so the salt can't be
/// caller-supplied or random; this value exists purely for Argon2's own
/// domain separation, not as a secret.
const MASTER_KEY_SALT: &[u8] = b"encryption-domain";

/// An archive's master key. Zeroized on drop so a dropped `Archive` does
/// not leave key material sitting in freed heap memory.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn derive(password: &[u8], cfg: &CryptoConfig) -> Result<Self> {
        let params = Params::new(
            cfg.argon2_memory_kib,
            cfg.argon2_iterations,
            cfg.argon2_parallelism,
            Some(32),
        )
        .map_err(|e| Error::Crypto(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut out = [0u8; 32];
        argon2
            .hash_password_into(password, MASTER_KEY_SALT, &mut out)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self(out))
    }

    /// Derives a domain-separated subkey via HKDF-SHA256. `label`
    /// distinguishes purposes (block AEAD keys vs. the integrity tree's
    /// HMAC key); `info` further binds the output (e.g. a block pointer).
    pub fn derive_subkey(&self, label: &[u8], info: &[u8]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; 32];
        let mut full_info = Vec::with_capacity(label.len() + info.len());
        full_info.extend_from_slice(label);
        full_info.extend_from_slice(info);
        hk.expand(&full_info, &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_password_derives_the_same_key() {
        let cfg = CryptoConfig {
            argon2_memory_kib: 8 * 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        };
        let a = MasterKey::derive(b"hunter2", &cfg).unwrap();
        let b = MasterKey::derive(b"hunter2", &cfg).unwrap();
        assert_eq!(a.derive_subkey(b"x", b"y"), b.derive_subkey(b"x", b"y"));
    }

    #[test]
    fn different_passwords_derive_different_keys() {
        let cfg = CryptoConfig {
            argon2_memory_kib: 8 * 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        };
        let a = MasterKey::derive(b"hunter2", &cfg).unwrap();
        let b = MasterKey::derive(b"correct horse battery staple", &cfg).unwrap();
        assert_ne!(a.derive_subkey(b"x", b"y"), b.derive_subkey(b"x", b"y"));
    }

    #[test]
    fn different_labels_derive_different_subkeys() {
        let cfg = CryptoConfig {
            argon2_memory_kib: 8 * 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        };
        let key = MasterKey::derive(b"hunter2", &cfg).unwrap();
        assert_ne!(
            key.derive_subkey(b"block-aead", b"\x01"),
            key.derive_subkey(b"integrity-hmac", b"\x01")
        );
    }

    #[test]
    fn different_info_derives_different_subkeys() {
        let cfg = CryptoConfig {
            argon2_memory_kib: 8 * 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        };
        let key = MasterKey::derive(b"hunter2", &cfg).unwrap();
        assert_ne!(
            key.derive_subkey(b"block-aead", b"\x01"),
            key.derive_subkey(b"block-aead", b"\x02")
        );
    }
}
