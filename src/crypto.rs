//! Credential-at-rest protection: authenticated encryption and hashed lookup
//!
//! Two implementations sit behind one contract: a keyed AES-256-GCM service
//! and a passthrough used when no encryption passphrase is configured. The
//! digest doubles as the stable lookup index for plaintext values.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Substituted for a credential value that no longer decrypts. Only ever
/// shown in user-facing projections; never treated as a usable credential.
pub const DECRYPT_SENTINEL: &str = "failed-to-decrypt";

/// Fixed PBKDF2 salt; changing it invalidates every stored ciphertext.
const KEY_DERIVATION_SALT: &[u8] = b"gpt-load-encryption-v1";
const KEY_DERIVATION_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// Symmetric encryption and keyed-digest contract for credential values.
pub trait CryptoService: Send + Sync {
    /// Encrypt a plaintext into an opaque hex blob (nonce prepended).
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Decrypt a blob produced by [`CryptoService::encrypt`].
    fn decrypt(&self, ciphertext: &str) -> Result<String>;

    /// Deterministic digest used as a lookup index; keyed when a passphrase
    /// is configured, plain SHA-256 otherwise. Empty input digests to "".
    fn digest(&self, plaintext: &str) -> String;
}

/// Build a crypto service for the given passphrase. An empty passphrase
/// selects the passthrough implementation.
pub fn new_service(passphrase: &str) -> Arc<dyn CryptoService> {
    if passphrase.is_empty() {
        return Arc::new(PassthroughCrypto);
    }

    validate_passphrase_strength(passphrase, "ENCRYPTION_KEY");
    Arc::new(AesGcmCrypto::new(derive_key(passphrase)))
}

/// Derive a 32-byte AES key from a user passphrase via PBKDF2-SHA256.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        KEY_DERIVATION_SALT,
        KEY_DERIVATION_ROUNDS,
        &mut key,
    );
    key
}

/// Warn (never fail) when a secret looks weak.
pub fn validate_passphrase_strength(passphrase: &str, field: &str) {
    if passphrase.len() < 16 {
        warn!("{field} is shorter than 16 characters, consider using a longer passphrase");
    }

    let lower = passphrase.to_lowercase();
    const WEAK_PATTERNS: [&str; 5] = ["password", "sk-123456", "123456", "admin", "secret"];
    if WEAK_PATTERNS.iter().any(|p| lower.contains(p)) {
        warn!("{field} contains common weak patterns, consider using a stronger passphrase");
    }
}

/// AES-256-GCM with HMAC-SHA256 digests.
pub struct AesGcmCrypto {
    cipher: Aes256Gcm,
    key: [u8; 32],
}

impl AesGcmCrypto {
    pub fn new(key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new((&key).into());
        Self { cipher, key }
    }
}

impl CryptoService for AesGcmCrypto {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::internal("encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(hex::encode(blob))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let data = hex::decode(ciphertext)
            .map_err(|e| Error::CorruptCiphertext(format!("invalid hex data: {e}")))?;

        if data.len() < NONCE_LEN {
            return Err(Error::CorruptCiphertext("ciphertext too short".to_string()));
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::CorruptCiphertext("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::CorruptCiphertext("plaintext is not valid UTF-8".to_string()))
    }

    fn digest(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(plaintext.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Identity encrypt/decrypt with unkeyed SHA-256 digests; selected when no
/// passphrase is configured.
pub struct PassthroughCrypto;

impl CryptoService for PassthroughCrypto {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }

    fn digest(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }
        hex::encode(Sha256::digest(plaintext.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_roundtrip() {
        let svc = AesGcmCrypto::new(derive_key("a-strong-passphrase-for-tests"));
        let blob = svc.encrypt("sk-test-value").unwrap();
        assert_ne!(blob, "sk-test-value");
        assert_eq!(svc.decrypt(&blob).unwrap(), "sk-test-value");
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let svc = AesGcmCrypto::new(derive_key("a-strong-passphrase-for-tests"));
        let a = svc.encrypt("same-value").unwrap();
        let b = svc.encrypt("same-value").unwrap();
        assert_ne!(a, b);
        assert_eq!(svc.decrypt(&a).unwrap(), svc.decrypt(&b).unwrap());
    }

    #[test]
    fn test_corrupt_ciphertext_is_rejected() {
        let svc = AesGcmCrypto::new(derive_key("a-strong-passphrase-for-tests"));

        assert!(matches!(
            svc.decrypt("not hex at all"),
            Err(Error::CorruptCiphertext(_))
        ));
        assert!(matches!(
            svc.decrypt("deadbeef"),
            Err(Error::CorruptCiphertext(_))
        ));

        // Valid blob tampered after the nonce fails authentication.
        let mut blob = svc.encrypt("sk-test").unwrap();
        let tail = blob.split_off(blob.len() - 2);
        blob.push_str(if tail == "00" { "11" } else { "00" });
        assert!(matches!(
            svc.decrypt(&blob),
            Err(Error::CorruptCiphertext(_))
        ));
    }

    #[test]
    fn test_keyed_digest_is_deterministic_and_keyed() {
        let a = AesGcmCrypto::new(derive_key("passphrase-one-passphrase-one"));
        let b = AesGcmCrypto::new(derive_key("passphrase-two-passphrase-two"));

        assert_eq!(a.digest("sk-x"), a.digest("sk-x"));
        assert_ne!(a.digest("sk-x"), b.digest("sk-x"));
        assert_ne!(a.digest("sk-x"), PassthroughCrypto.digest("sk-x"));
        assert_eq!(a.digest(""), "");
    }

    #[test]
    fn test_passthrough_is_identity() {
        let svc = PassthroughCrypto;
        assert_eq!(svc.encrypt("sk-plain").unwrap(), "sk-plain");
        assert_eq!(svc.decrypt("sk-plain").unwrap(), "sk-plain");
        // Unkeyed digest is plain SHA-256.
        assert_eq!(
            svc.digest("sk-plain"),
            hex::encode(Sha256::digest(b"sk-plain"))
        );
    }

    #[test]
    fn test_factory_selects_implementation() {
        let passthrough = new_service("");
        assert_eq!(passthrough.encrypt("v").unwrap(), "v");

        let keyed = new_service("Str0ngPass!234567");
        assert_ne!(keyed.encrypt("v").unwrap(), "v");
    }
}
