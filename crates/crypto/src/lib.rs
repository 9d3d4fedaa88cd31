//! End-to-end encryption for wire payloads.
//!
//! All RPC params, RPC results, state blobs, and message contents cross the
//! wire as base64(nonce ‖ ciphertext). Two key variants exist: `legacy`
//! (XChaCha20-Poly1305, 24-byte nonce) and `dataKey` (AES-256-GCM, 12-byte
//! nonce). Decryption failures of any kind collapse into a single
//! distinguished [`Undecryptable`] outcome so callers can return the wire
//! `DECRYPTION_FAILED` error instead of guessing.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::XChaCha20Poly1305;
use rand::Rng;
use serde::Serialize;

/// Key length in bytes for both variants.
pub const KEY_BYTES: usize = 32;

const XCHACHA_NONCE_BYTES: usize = 24;
const GCM_NONCE_BYTES: usize = 12;

/// Which AEAD construction the peer derived this key for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVariant {
    /// XChaCha20-Poly1305 with a 24-byte nonce.
    Legacy,
    /// AES-256-GCM with a 12-byte nonce.
    DataKey,
}

/// Errors preparing plaintext for the wire.
#[derive(Debug, thiserror::Error)]
pub enum EncryptError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cipher failure")]
    Cipher,
}

/// The single decryption outcome: the ciphertext could not be opened.
///
/// Bad base64, a truncated buffer, an authentication failure, and non-JSON
/// plaintext all land here. Callers must surface this, never skip it.
#[derive(Debug, thiserror::Error)]
#[error("ciphertext could not be decrypted")]
pub struct Undecryptable;

/// A key plus its variant; one per scope, immutable for the connection's
/// lifetime.
#[derive(Clone)]
pub struct EncryptionContext {
    key: [u8; KEY_BYTES],
    variant: KeyVariant,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("EncryptionContext")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl EncryptionContext {
    pub fn new(key: [u8; KEY_BYTES], variant: KeyVariant) -> Self {
        Self { key, variant }
    }

    /// Parses a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str, variant: KeyVariant) -> Result<Self, Undecryptable> {
        let bytes = BASE64.decode(encoded).map_err(|_| Undecryptable)?;
        let key: [u8; KEY_BYTES] = bytes.try_into().map_err(|_| Undecryptable)?;
        Ok(Self::new(key, variant))
    }

    pub fn variant(&self) -> KeyVariant {
        self.variant
    }

    /// Serializes `value` to JSON and seals it as base64(nonce ‖ ciphertext).
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, EncryptError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = match self.variant {
            KeyVariant::Legacy => self.seal_xchacha(&plaintext)?,
            KeyVariant::DataKey => self.seal_gcm(&plaintext)?,
        };
        Ok(BASE64.encode(sealed))
    }

    /// Opens base64(nonce ‖ ciphertext) and parses the plaintext as JSON.
    pub fn decrypt(&self, ciphertext: &str) -> Result<serde_json::Value, Undecryptable> {
        let raw = BASE64.decode(ciphertext).map_err(|_| Undecryptable)?;
        let plaintext = match self.variant {
            KeyVariant::Legacy => self.open_xchacha(&raw)?,
            KeyVariant::DataKey => self.open_gcm(&raw)?,
        };
        serde_json::from_slice(&plaintext).map_err(|_| Undecryptable)
    }

    fn seal_xchacha(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0u8; XCHACHA_NONCE_BYTES];
        rand::thread_rng().fill(&mut nonce);
        let sealed = cipher
            .encrypt((&nonce).into(), plaintext)
            .map_err(|_| EncryptError::Cipher)?;
        let mut out = Vec::with_capacity(XCHACHA_NONCE_BYTES + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open_xchacha(&self, raw: &[u8]) -> Result<Vec<u8>, Undecryptable> {
        if raw.len() <= XCHACHA_NONCE_BYTES {
            return Err(Undecryptable);
        }
        let (nonce, sealed) = raw.split_at(XCHACHA_NONCE_BYTES);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(chacha20poly1305::XNonce::from_slice(nonce), sealed)
            .map_err(|_| Undecryptable)
    }

    fn seal_gcm(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
        let cipher = Aes256Gcm::new((&self.key).into());
        let mut nonce = [0u8; GCM_NONCE_BYTES];
        rand::thread_rng().fill(&mut nonce);
        let sealed = cipher
            .encrypt((&nonce).into(), plaintext)
            .map_err(|_| EncryptError::Cipher)?;
        let mut out = Vec::with_capacity(GCM_NONCE_BYTES + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open_gcm(&self, raw: &[u8]) -> Result<Vec<u8>, Undecryptable> {
        if raw.len() <= GCM_NONCE_BYTES {
            return Err(Undecryptable);
        }
        let (nonce, sealed) = raw.split_at(GCM_NONCE_BYTES);
        let cipher = Aes256Gcm::new((&self.key).into());
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), sealed)
            .map_err(|_| Undecryptable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(variant: KeyVariant) -> EncryptionContext {
        EncryptionContext::new([7u8; KEY_BYTES], variant)
    }

    #[test]
    fn legacy_roundtrip() {
        let c = ctx(KeyVariant::Legacy);
        let value = serde_json::json!({"role": "user", "n": 42});
        let sealed = c.encrypt(&value).unwrap();
        assert_ne!(sealed, serde_json::to_string(&value).unwrap());
        assert_eq!(c.decrypt(&sealed).unwrap(), value);
    }

    #[test]
    fn data_key_roundtrip() {
        let c = ctx(KeyVariant::DataKey);
        let value = serde_json::json!(["a", 1, null]);
        let sealed = c.encrypt(&value).unwrap();
        assert_eq!(c.decrypt(&sealed).unwrap(), value);
    }

    #[test]
    fn nonces_differ_per_encryption() {
        let c = ctx(KeyVariant::Legacy);
        let value = serde_json::json!("same");
        assert_ne!(c.encrypt(&value).unwrap(), c.encrypt(&value).unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_undecryptable() {
        let c = ctx(KeyVariant::Legacy);
        let sealed = c.encrypt(&serde_json::json!({"k": 1})).unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(c.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn wrong_key_is_undecryptable() {
        let a = ctx(KeyVariant::DataKey);
        let b = EncryptionContext::new([9u8; KEY_BYTES], KeyVariant::DataKey);
        let sealed = a.encrypt(&serde_json::json!(true)).unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn variants_are_not_interchangeable() {
        let legacy = ctx(KeyVariant::Legacy);
        let data_key = ctx(KeyVariant::DataKey);
        let sealed = legacy.encrypt(&serde_json::json!(1)).unwrap();
        assert!(data_key.decrypt(&sealed).is_err());
    }

    #[test]
    fn garbage_inputs_are_undecryptable() {
        let c = ctx(KeyVariant::Legacy);
        assert!(c.decrypt("").is_err());
        assert!(c.decrypt("not base64 !!!").is_err());
        // Valid base64, too short to hold a nonce.
        assert!(c.decrypt(&BASE64.encode(b"tiny")).is_err());
    }

    #[test]
    fn base64_key_parsing() {
        let encoded = BASE64.encode([3u8; KEY_BYTES]);
        let c = EncryptionContext::from_base64_key(&encoded, KeyVariant::Legacy).unwrap();
        assert_eq!(c.variant(), KeyVariant::Legacy);

        assert!(EncryptionContext::from_base64_key("xx", KeyVariant::Legacy).is_err());
        let short = BASE64.encode([3u8; 16]);
        assert!(EncryptionContext::from_base64_key(&short, KeyVariant::Legacy).is_err());
    }

    #[test]
    fn debug_hides_key_material() {
        let c = ctx(KeyVariant::Legacy);
        let debug = format!("{c:?}");
        assert!(!debug.contains('7'));
        assert!(debug.contains("variant"));
    }
}
