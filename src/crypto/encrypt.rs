//! AES-256-GCM encryption at rest for intent context and metadata.
//!
//! Encrypted values are persisted as a sentinel-tagged JSON envelope:
//!
//! ```json
//! {"__enc": "aes-256-gcm.v1", "nonce": "<hex>", "data": "<hex>"}
//! ```
//!
//! Detection is by the `__enc` sentinel key, never by column type, so a
//! single JSON column can hold clear rows and encrypted rows side by side.
//! A field value is either fully clear or fully enveloped, never mixed.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use serde_json::{Map, Value};

use crate::errors::{CoreError, CoreResult};

/// Sentinel key marking an encrypted envelope.
pub const ENVELOPE_SENTINEL: &str = "__enc";

/// Algorithm/version tag stored in the sentinel field.
const ALGORITHM_TAG: &str = "aes-256-gcm.v1";

/// Returns true when the value is an encrypted envelope.
pub fn is_envelope(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key(ENVELOPE_SENTINEL))
}

/// Encrypts and decrypts JSON maps with a tenant-shared AES-256 key.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Build a cipher from a 64-character hex key.
    pub fn from_hex_key(key_hex: &str) -> CoreResult<Self> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| CoreError::Encryption(format!("invalid key hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(CoreError::Encryption(format!(
                "key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Wrap a clear JSON map into an encrypted envelope value.
    pub fn encrypt_map(&self, map: &Map<String, Value>) -> CoreResult<Value> {
        let plaintext = serde_json::to_vec(&Value::Object(map.clone()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CoreError::Encryption("payload encryption failed".to_string()))?;

        Ok(serde_json::json!({
            ENVELOPE_SENTINEL: ALGORITHM_TAG,
            "nonce": hex::encode(nonce),
            "data": hex::encode(ciphertext),
        }))
    }

    /// Unwrap an envelope back into the clear JSON map.
    ///
    /// Clear (non-envelope) object values pass through untouched, so readers
    /// can call this unconditionally.
    pub fn decrypt_value(&self, value: &Value) -> CoreResult<Map<String, Value>> {
        let Some(object) = value.as_object() else {
            return Err(CoreError::Encryption(
                "payload is not a JSON object".to_string(),
            ));
        };
        if !object.contains_key(ENVELOPE_SENTINEL) {
            return Ok(object.clone());
        }

        let tag = object
            .get(ENVELOPE_SENTINEL)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if tag != ALGORITHM_TAG {
            return Err(CoreError::Encryption(format!(
                "unsupported envelope algorithm: {tag}"
            )));
        }

        let nonce_hex = object.get("nonce").and_then(Value::as_str).ok_or_else(|| {
            CoreError::Encryption("envelope is missing its nonce".to_string())
        })?;
        let data_hex = object.get("data").and_then(Value::as_str).ok_or_else(|| {
            CoreError::Encryption("envelope is missing its ciphertext".to_string())
        })?;

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|e| CoreError::Encryption(format!("invalid nonce hex: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(CoreError::Encryption("nonce must be 12 bytes".to_string()));
        }
        let ciphertext = hex::decode(data_hex)
            .map_err(|e| CoreError::Encryption(format!("invalid ciphertext hex: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| CoreError::Encryption("payload decryption failed".to_string()))?;

        match serde_json::from_slice::<Value>(&plaintext)? {
            Value::Object(map) => Ok(map),
            _ => Err(CoreError::Encryption(
                "decrypted payload is not a JSON object".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> PayloadCipher {
        PayloadCipher::from_hex_key(&"ab".repeat(32)).expect("cipher")
    }

    fn sample_map() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("to".to_string(), Value::String("a@b".to_string()));
        map.insert("count".to_string(), Value::from(3));
        map
    }

    #[test]
    fn test_encrypt_decrypt_is_identity() {
        let cipher = test_cipher();
        let clear = sample_map();

        let envelope = cipher.encrypt_map(&clear).expect("encrypt");
        assert!(is_envelope(&envelope));

        let decrypted = cipher.decrypt_value(&envelope).expect("decrypt");
        assert_eq!(decrypted, clear);
    }

    #[test]
    fn test_clear_values_pass_through() {
        let cipher = test_cipher();
        let clear = Value::Object(sample_map());

        assert!(!is_envelope(&clear));
        assert_eq!(cipher.decrypt_value(&clear).expect("pass"), sample_map());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = test_cipher();
        let mut envelope = cipher.encrypt_map(&sample_map()).expect("encrypt");

        let data = envelope["data"].as_str().expect("data").to_string();
        let flipped = if data.starts_with('0') { "1" } else { "0" };
        envelope["data"] = Value::String(format!("{flipped}{}", &data[1..]));

        assert!(cipher.decrypt_value(&envelope).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt_map(&sample_map()).expect("encrypt");

        let other = PayloadCipher::from_hex_key(&"cd".repeat(32)).expect("cipher");
        assert!(other.decrypt_value(&envelope).is_err());
    }
}
