//! Hashing for tamper-evident event chains and dedupe fingerprints.
//!
//! `ChainHash` always uses SHA-256 so integrity checks are stable across
//! store backends; the hex form is what is persisted in `hash` /
//! `previous_hash` columns. Canonical JSON (recursively sorted object keys)
//! guarantees the same logical event always hashes identically regardless of
//! map iteration order.

use std::{fmt, str::FromStr, sync::Once};

use ring::hmac;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::{CoreError, CoreResult};

/// A SHA-256 hash in lowercase hex, as stored in event rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainHash(String);

impl ChainHash {
    /// The fixed predecessor of the first event in every chain.
    pub fn zero() -> Self {
        Self("0".repeat(64))
    }

    /// Compute the hash of raw content bytes.
    pub fn compute(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute the chained hash `H(content || previous)`.
    ///
    /// The predecessor is mixed in as its hex ASCII form, matching what the
    /// store persists.
    pub fn chained(content: &[u8], previous: &ChainHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hasher.update(previous.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Create from an existing hex string with validation.
    pub fn new(hash: impl Into<String>) -> CoreResult<Self> {
        let hash = hash.into();
        if !Self::is_valid(&hash) {
            return Err(CoreError::Validation(format!(
                "invalid SHA-256 hash format: {hash}"
            )));
        }
        Ok(Self(hash))
    }

    /// Check valid format (64 hex chars).
    pub fn is_valid(hash: &str) -> bool {
        hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainHash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<ChainHash> for String {
    fn from(h: ChainHash) -> Self {
        h.0
    }
}

impl Serialize for ChainHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChainHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// Serialize an object to canonical JSON bytes (recursively sorted keys).
pub fn canonical_json_bytes<T: Serialize>(object: &T) -> CoreResult<Vec<u8>> {
    let mut value = serde_json::to_value(object)?;
    canonicalize_json(&mut value);
    Ok(serde_json::to_vec(&value)?)
}

fn canonicalize_json(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize_json(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, mut value) in entries {
                canonicalize_json(&mut value);
                sorted.insert(key, value);
            }
            *map = sorted;
        }
        _ => {}
    }
}

static PLAIN_FALLBACK_WARNING: Once = Once::new();

/// Compute a submission dedupe fingerprint over a pre-image.
///
/// With a secret configured this is HMAC-SHA-256; without one it degrades to
/// plain SHA-256 and logs a warning once per process. Production deployments
/// reject the secretless configuration up front
/// (see [`CoreConfig::validate`](crate::config::CoreConfig::validate)).
pub fn dedupe_fingerprint(secret: Option<&str>, preimage: &str) -> String {
    match secret {
        Some(secret) => {
            let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
            let tag = hmac::sign(&key, preimage.as_bytes());
            hex::encode(tag.as_ref())
        }
        None => {
            PLAIN_FALLBACK_WARNING.call_once(|| {
                tracing::warn!(
                    "no dedupe secret configured; falling back to unkeyed SHA-256 fingerprints"
                );
            });
            ChainHash::compute(preimage.as_bytes()).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Serialize)]
    struct MapWrapper {
        map: HashMap<String, String>,
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let mut map_a = HashMap::new();
        map_a.insert("b".to_string(), "2".to_string());
        map_a.insert("a".to_string(), "1".to_string());

        let mut map_b = HashMap::new();
        map_b.insert("a".to_string(), "1".to_string());
        map_b.insert("b".to_string(), "2".to_string());

        let bytes_a = canonical_json_bytes(&MapWrapper { map: map_a }).expect("canonical");
        let bytes_b = canonical_json_bytes(&MapWrapper { map: map_b }).expect("canonical");

        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_chained_hash_depends_on_predecessor() {
        let first = ChainHash::chained(b"event-0", &ChainHash::zero());
        let second = ChainHash::chained(b"event-1", &first);
        let forged = ChainHash::chained(b"event-1", &ChainHash::zero());

        assert_ne!(second, forged);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn test_zero_hash_shape() {
        let zero = ChainHash::zero();
        assert_eq!(zero.as_str(), "0".repeat(64));
        assert!(ChainHash::is_valid(zero.as_str()));
    }

    #[test]
    fn test_fingerprint_keyed_and_unkeyed_differ() {
        let keyed = dedupe_fingerprint(Some("secret-key"), "T1|E1|goal");
        let unkeyed = dedupe_fingerprint(None, "T1|E1|goal");

        assert_ne!(keyed, unkeyed);
        assert_eq!(keyed, dedupe_fingerprint(Some("secret-key"), "T1|E1|goal"));
        assert!(ChainHash::is_valid(&keyed));
    }
}
