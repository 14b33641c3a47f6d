//! Deterministic key derivation and address encoding
//!
//! Address layout (136 lowercase hex chars):
//!
//! ```text
//! | x (64 hex) | y (64 hex) | checksum (8 hex) |
//! ```
//!
//! The checksum is the first 4 bytes of SHA-256 over the 64 raw key bytes.

use bip39::Mnemonic;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Seed length in bytes
pub const SEED_LEN: usize = 32;

/// Public key length in hex (uncompressed x || y, no prefix)
pub const PUBLIC_KEY_HEX_LEN: usize = 128;

/// Checksum length in bytes
const CHECKSUM_LEN: usize = 4;

/// Address length in hex
pub const ADDRESS_HEX_LEN: usize = PUBLIC_KEY_HEX_LEN + CHECKSUM_LEN * 2;

/// Root secret for all derived keys. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_LEN]);

impl Seed {
    /// Build a seed from exactly 32 raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SEED_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidSeed(format!("expected {} bytes, got {}", SEED_LEN, bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Build a seed from 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != SEED_LEN * 2 {
            return Err(Error::InvalidSeed(format!(
                "expected {} hex chars, got {}",
                SEED_LEN * 2,
                s.len()
            )));
        }
        let mut bytes = hex::decode(s).map_err(|e| Error::InvalidSeed(e.to_string()))?;
        let seed = Self::from_bytes(&bytes);
        bytes.zeroize();
        seed
    }

    /// Build a seed from a BIP-39 phrase (empty passphrase)
    pub fn from_mnemonic(phrase: &str) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(phrase)
            .map_err(|e| Error::InvalidSeed(format!("invalid mnemonic: {}", e)))?;
        let mut bip39_seed = mnemonic.to_seed("");
        let digest: [u8; SEED_LEN] = Sha256::digest(bip39_seed).into();
        bip39_seed.zeroize();
        Ok(Self(digest))
    }

    /// Generate a fresh 12-word recovery phrase
    pub fn generate_mnemonic() -> Result<String> {
        Mnemonic::generate(12)
            .map(|m| m.to_string())
            .map_err(|e| Error::Internal(format!("mnemonic generation failed: {}", e)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(***)")
    }
}

/// secp256k1 key pair, optionally tagged with its derivation index
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
    index: Option<u32>,
}

impl KeyPair {
    /// Build from a 32-byte secret scalar
    pub fn from_secret_bytes(bytes: &[u8], index: Option<u32>) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
        Ok(Self {
            secret,
            public,
            index,
        })
    }

    /// Build from a hex-encoded private key
    pub fn from_private_key_hex(s: &str, index: Option<u32>) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Self::from_secret_bytes(&bytes, index)
    }

    /// Uncompressed public key without the 0x04 prefix. Used as the user hash.
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public.serialize_uncompressed()[1..])
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// `None` for the user (root) key
    pub fn derivation_index(&self) -> Option<u32> {
        self.index
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Network address of this key pair
    pub fn to_address(&self) -> AddressHex {
        AddressHex::from_public_key(&self.public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Root key pair. Signs messages and trust score requests, never spends.
pub fn derive_user_key_pair(seed: &Seed) -> Result<KeyPair> {
    let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    KeyPair::from_secret_bytes(&digest, None)
        .map_err(|e| Error::InvalidSeed(format!("seed yields no valid user key: {}", e)))
}

/// Spending key pair for address `index`
pub fn derive_address_key_pair(seed: &Seed, index: u32) -> Result<KeyPair> {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(index.to_be_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    KeyPair::from_secret_bytes(&digest, Some(index)).map_err(|e| {
        Error::InvalidSeed(format!("seed yields no valid key at index {}: {}", index, e))
    })
}

fn checksum(key_bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(key_bytes);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Validated address in hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressHex(String);

impl AddressHex {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let uncompressed = public.serialize_uncompressed();
        let key_bytes = &uncompressed[1..];
        let mut hex_str = hex::encode(key_bytes);
        hex_str.push_str(&hex::encode(checksum(key_bytes)));
        Self(hex_str)
    }

    /// Parse and verify length, charset and checksum
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s.len() != ADDRESS_HEX_LEN {
            return Err(Error::InvalidAddress(format!(
                "expected {} hex chars, got {}",
                ADDRESS_HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(&s).map_err(|e| Error::InvalidAddress(e.to_string()))?;
        let (key_bytes, sum) = bytes.split_at(PUBLIC_KEY_HEX_LEN / 2);
        if checksum(key_bytes) != sum {
            return Err(Error::InvalidAddress(format!("checksum mismatch for {}", s)));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Public key part (first 128 hex chars)
    pub fn public_key_hex(&self) -> &str {
        &self.0[..PUBLIC_KEY_HEX_LEN]
    }
}

impl fmt::Display for AddressHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AddressHex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AddressHex {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AddressHex> for String {
    fn from(address: AddressHex) -> Self {
        address.0
    }
}

impl AsRef<str> for AddressHex {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_seed() -> Seed {
        Seed::from_hex("5f2b1c7e9a3d4f6081726354a1b2c3d4e5f60718293a4b5c6d7e8f9012345678").unwrap()
    }

    #[test]
    fn test_address_derivation_is_deterministic() {
        let seed = test_seed();
        for index in [0u32, 1, 7, 1000] {
            let a = derive_address_key_pair(&seed, index).unwrap();
            let b = derive_address_key_pair(&seed, index).unwrap();
            assert_eq!(a.to_address(), b.to_address());
            assert_eq!(a.private_key_hex(), b.private_key_hex());
            assert_eq!(a.derivation_index(), Some(index));
        }
    }

    #[test]
    fn test_distinct_indices_give_distinct_addresses() {
        let seed = test_seed();
        let addresses: HashSet<_> = (0..50)
            .map(|i| derive_address_key_pair(&seed, i).unwrap().to_address())
            .collect();
        assert_eq!(addresses.len(), 50);
    }

    #[test]
    fn test_user_key_differs_from_address_keys() {
        let seed = test_seed();
        let user = derive_user_key_pair(&seed).unwrap();
        assert_eq!(user.derivation_index(), None);
        assert_eq!(user.public_key_hex().len(), PUBLIC_KEY_HEX_LEN);
        let first = derive_address_key_pair(&seed, 0).unwrap();
        assert_ne!(user.public_key_hex(), first.public_key_hex());
    }

    #[test]
    fn test_invalid_seed() {
        assert!(matches!(Seed::from_bytes(&[1u8; 16]), Err(Error::InvalidSeed(_))));
        assert!(matches!(Seed::from_hex("abcd"), Err(Error::InvalidSeed(_))));
        let not_hex = "z".repeat(64);
        assert!(matches!(Seed::from_hex(&not_hex), Err(Error::InvalidSeed(_))));
        assert!(matches!(
            Seed::from_mnemonic("definitely not a valid phrase"),
            Err(Error::InvalidSeed(_))
        ));
    }

    #[test]
    fn test_mnemonic_seed_is_stable() {
        let phrase = Seed::generate_mnemonic().unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
        let a = Seed::from_mnemonic(&phrase).unwrap();
        let b = Seed::from_mnemonic(&phrase).unwrap();
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn test_address_parse_roundtrip_and_checksum() {
        let address = derive_address_key_pair(&test_seed(), 3).unwrap().to_address();
        assert_eq!(address.as_str().len(), ADDRESS_HEX_LEN);

        let parsed = AddressHex::parse(&address.as_str().to_uppercase()).unwrap();
        assert_eq!(parsed, address);

        // Flip one checksum nibble
        let mut tampered = address.as_str().to_string();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(matches!(AddressHex::parse(&tampered), Err(Error::InvalidAddress(_))));

        assert!(AddressHex::parse("destinationAddressInHex").is_err());
    }

    #[test]
    fn test_seed_debug_is_masked() {
        assert_eq!(format!("{:?}", test_seed()), "Seed(***)");
    }
}
