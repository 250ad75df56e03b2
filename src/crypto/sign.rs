//! Ed25519 signing for audit records.
//!
//! The audit chain signs each governance decision so downstream consumers
//! can verify records without trusting the store. Keys are held as PKCS#8
//! documents; the host is responsible for durable key custody.

use ring::{
    rand::SystemRandom,
    signature::{self, Ed25519KeyPair, KeyPair},
};

use crate::errors::{CoreError, CoreResult};

/// Algorithm tag persisted alongside every signature.
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Signs audit records with a process-held Ed25519 key.
pub struct AuditSigner {
    key_pair: Ed25519KeyPair,
    public_key_hex: String,
}

impl AuditSigner {
    /// Generate a fresh key pair, returning the signer and the PKCS#8
    /// document the host should persist for restart continuity.
    pub fn generate() -> CoreResult<(Self, Vec<u8>)> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| CoreError::Encryption(format!("signing key generation failed: {e}")))?;
        let signer = Self::from_pkcs8(document.as_ref())?;
        Ok((signer, document.as_ref().to_vec()))
    }

    /// Load a signer from a previously generated PKCS#8 document.
    pub fn from_pkcs8(document: &[u8]) -> CoreResult<Self> {
        let key_pair = Ed25519KeyPair::from_pkcs8(document)
            .map_err(|e| CoreError::Encryption(format!("invalid signing key document: {e}")))?;
        let public_key_hex = hex::encode(key_pair.public_key().as_ref());
        Ok(Self {
            key_pair,
            public_key_hex,
        })
    }

    /// Sign a message, returning the signature in hex.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.key_pair.sign(message).as_ref())
    }

    /// Hex form of the public key, persisted on every audit record.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }
}

/// Verify a hex signature over a message against a hex public key.
///
/// Returns `Ok(false)` for a well-formed but non-matching signature; errors
/// are reserved for malformed inputs.
pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> CoreResult<bool> {
    let public_key = hex::decode(public_key_hex)
        .map_err(|e| CoreError::Validation(format!("invalid public key hex: {e}")))?;
    let sig = hex::decode(signature_hex)
        .map_err(|e| CoreError::Validation(format!("invalid signature hex: {e}")))?;

    let key = signature::UnparsedPublicKey::new(&signature::ED25519, public_key);
    Ok(key.verify(message, &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_round_trip() {
        let (signer, _doc) = AuditSigner::generate().expect("generate");
        let sig = signer.sign(b"decision-record");

        assert!(
            verify_signature(signer.public_key_hex(), b"decision-record", &sig).expect("verify")
        );
        assert!(!verify_signature(signer.public_key_hex(), b"tampered", &sig).expect("verify"));
    }

    #[test]
    fn test_signer_restores_from_pkcs8() {
        let (signer, doc) = AuditSigner::generate().expect("generate");
        let restored = AuditSigner::from_pkcs8(&doc).expect("restore");

        assert_eq!(signer.public_key_hex(), restored.public_key_hex());

        let sig = restored.sign(b"message");
        assert!(verify_signature(signer.public_key_hex(), b"message", &sig).expect("verify"));
    }
}
