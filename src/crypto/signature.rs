//! ECDSA signatures over SHA-256 digests
//!
//! Signing is deterministic (RFC 6979), so identical inputs always produce
//! identical signatures.

use secp256k1::ecdsa;
use secp256k1::{Message, PublicKey, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::keys::{KeyPair, PUBLIC_KEY_HEX_LEN};
use crate::error::{Error, Result};

/// Signature in the node's `{r, s}` hex form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
}

impl Signature {
    fn from_ecdsa(signature: &ecdsa::Signature) -> Self {
        let compact = signature.serialize_compact();
        Self {
            r: hex::encode(&compact[..32]),
            s: hex::encode(&compact[32..]),
        }
    }

    fn to_ecdsa(&self) -> Result<ecdsa::Signature> {
        let mut compact = hex::decode(&self.r).map_err(|e| Error::InvalidKey(e.to_string()))?;
        compact.extend(hex::decode(&self.s).map_err(|e| Error::InvalidKey(e.to_string()))?);
        Ok(ecdsa::Signature::from_compact(&compact)?)
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Sign a precomputed 32-byte digest
pub fn sign_digest(key: &KeyPair, digest: &[u8; 32]) -> Signature {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(*digest);
    Signature::from_ecdsa(&secp.sign_ecdsa(&message, key.secret_key()))
}

/// Hash `message` with SHA-256 and sign the digest
pub fn sign_message(key: &KeyPair, message: &[u8]) -> Signature {
    sign_digest(key, &sha256(message))
}

/// Verify `signature` over `digest` against a 128-char public key hex
pub fn verify_digest(public_key_hex: &str, digest: &[u8; 32], signature: &Signature) -> Result<bool> {
    if public_key_hex.len() != PUBLIC_KEY_HEX_LEN {
        return Err(Error::InvalidKey(format!(
            "expected {} hex chars, got {}",
            PUBLIC_KEY_HEX_LEN,
            public_key_hex.len()
        )));
    }
    let mut raw = vec![0x04];
    raw.extend(hex::decode(public_key_hex).map_err(|e| Error::InvalidKey(e.to_string()))?);
    let public = PublicKey::from_slice(&raw)?;

    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(*digest);
    Ok(secp
        .verify_ecdsa(&message, &signature.to_ecdsa()?, &public)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{derive_address_key_pair, derive_user_key_pair, Seed};

    fn seed() -> Seed {
        Seed::from_bytes(&[42u8; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let key = derive_user_key_pair(&seed()).unwrap();
        let digest = sha256(b"transfer 10 coti");
        let sig = sign_digest(&key, &digest);

        assert_eq!(sig.r.len(), 64);
        assert_eq!(sig.s.len(), 64);
        assert!(verify_digest(&key.public_key_hex(), &digest, &sig).unwrap());

        let other = sha256(b"transfer 11 coti");
        assert!(!verify_digest(&key.public_key_hex(), &other, &sig).unwrap());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = derive_address_key_pair(&seed(), 2).unwrap();
        assert_eq!(sign_message(&key, b"hello"), sign_message(&key, b"hello"));
    }

    #[test]
    fn test_wrong_key_does_not_verify() {
        let a = derive_address_key_pair(&seed(), 0).unwrap();
        let b = derive_address_key_pair(&seed(), 1).unwrap();
        let digest = sha256(b"payload");
        let sig = sign_digest(&a, &digest);
        assert!(!verify_digest(&b.public_key_hex(), &digest, &sig).unwrap());
        assert!(verify_digest("abcd", &digest, &sig).is_err());
    }
}
