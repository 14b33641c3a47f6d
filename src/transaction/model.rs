//! Transaction wire model, hashing and signing
//!
//! A transaction is an ordered list of base lines whose amounts sum to zero
//! per currency: negative input lines fund positive receiver and fee lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::crypto::{sign_digest, verify_digest, AddressHex, KeyPair, Signature};
use crate::error::{Error, Result};
use crate::wallet::types::{timestamp, Amount, HistoryEntry, ReducedTransaction};

/// Transaction type sent to the node
pub const TRANSFER_TYPE: &str = "Transfer";

/// Role of a base line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineKind {
    /// Funds leaving an address (negative amount)
    #[serde(rename = "IBT")]
    Input,
    /// Fee to the full node (positive)
    #[serde(rename = "FFBT")]
    FullNodeFee,
    /// Fee to the network (positive)
    #[serde(rename = "NFBT")]
    NetworkFee,
    /// Funds arriving at the destination (positive)
    #[serde(rename = "RBT")]
    Receiver,
}

impl LineKind {
    fn tag(&self) -> &'static [u8] {
        match self {
            LineKind::Input => b"IBT",
            LineKind::FullNodeFee => b"FFBT",
            LineKind::NetworkFee => b"NFBT",
            LineKind::Receiver => b"RBT",
        }
    }
}

/// One line of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseLine {
    pub address_hash: AddressHex,
    pub amount: Amount,
    pub name: LineKind,
    #[serde(with = "timestamp")]
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_currency_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_data: Option<Signature>,
}

impl BaseLine {
    pub fn new(address: AddressHex, amount: Amount, kind: LineKind, create_time: DateTime<Utc>) -> Self {
        Self {
            address_hash: address,
            amount,
            name: kind,
            create_time,
            currency_hash: None,
            original_currency_hash: None,
            hash: None,
            signature_data: None,
        }
    }

    pub fn with_currency(mut self, currency_hash: &str, original_currency_hash: &str) -> Self {
        self.currency_hash = Some(currency_hash.to_string());
        self.original_currency_hash = Some(original_currency_hash.to_string());
        self
    }

    /// Digest over every field except hash and signature
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.address_hash.as_str().as_bytes());
        hasher.update(self.amount.normalize().to_string().as_bytes());
        hasher.update(self.create_time.timestamp_millis().to_be_bytes());
        hasher.update(self.name.tag());
        if let Some(currency) = &self.currency_hash {
            hasher.update(currency.as_bytes());
        }
        if let Some(original) = &self.original_currency_hash {
            hasher.update(original.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// Node acknowledgement of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub hash: String,
    pub status: String,
    pub message: Option<String>,
}

/// A transfer, unsigned until [`Transaction::sign`] succeeds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    base_transactions: Vec<BaseLine>,
    #[serde(with = "timestamp")]
    create_time: DateTime<Utc>,
    transaction_description: String,
    sender_hash: String,
    #[serde(rename = "type")]
    transaction_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_signature: Option<Signature>,
}

impl Transaction {
    pub(crate) fn unsigned(
        lines: Vec<BaseLine>,
        create_time: DateTime<Utc>,
        description: String,
        sender_hash: String,
    ) -> Self {
        Self {
            base_transactions: lines,
            create_time,
            transaction_description: description,
            sender_hash,
            transaction_type: TRANSFER_TYPE.to_string(),
            hash: None,
            sender_signature: None,
        }
    }

    /// Content hash, present once signed
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.hash.is_some()
    }

    pub fn lines(&self) -> &[BaseLine] {
        &self.base_transactions
    }

    pub fn inputs(&self) -> impl Iterator<Item = &BaseLine> {
        self.base_transactions
            .iter()
            .filter(|line| line.name == LineKind::Input)
    }

    pub fn receiver(&self) -> Option<&BaseLine> {
        self.base_transactions
            .iter()
            .find(|line| line.name == LineKind::Receiver)
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn sender_hash(&self) -> &str {
        &self.sender_hash
    }

    pub fn description(&self) -> &str {
        &self.transaction_description
    }

    pub fn sender_signature(&self) -> Option<&Signature> {
        self.sender_signature.as_ref()
    }

    /// Distinct addresses in line order
    pub fn addresses(&self) -> Vec<AddressHex> {
        let mut out: Vec<AddressHex> = Vec::new();
        for line in &self.base_transactions {
            if !out.contains(&line.address_hash) {
                out.push(line.address_hash.clone());
            }
        }
        out
    }

    /// Sum of line amounts per currency (`None` = untagged)
    pub fn sums_by_currency(&self) -> BTreeMap<Option<String>, Amount> {
        let mut sums = BTreeMap::new();
        for line in &self.base_transactions {
            *sums.entry(line.currency_hash.clone()).or_insert(Amount::ZERO) += line.amount;
        }
        sums
    }

    /// Digest over all finalized fields
    pub fn content_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for line in &self.base_transactions {
            hasher.update(line.digest());
        }
        hasher.update(self.create_time.timestamp_millis().to_be_bytes());
        hasher.update(self.transaction_description.as_bytes());
        hasher.update(self.sender_hash.as_bytes());
        hasher.update(self.transaction_type.as_bytes());
        hasher.finalize().into()
    }

    /// Hash the transaction and sign it.
    ///
    /// `user` authenticates the transaction as a whole; it does not authorize
    /// spending. `address_keys` must cover every input address. By convention
    /// the fee address key comes last when it is not among the inputs; keys
    /// are matched to lines by their derived address, so extra keys are
    /// ignored. Fails with `AlreadySigned` on a second call. On error the
    /// transaction is left untouched.
    pub fn sign(&mut self, user: &KeyPair, address_keys: &[KeyPair]) -> Result<()> {
        if let Some(hash) = &self.hash {
            return Err(Error::AlreadySigned(hash.clone()));
        }
        if user.public_key_hex() != self.sender_hash {
            return Err(Error::Validation(
                "user key does not match the transaction sender".to_string(),
            ));
        }

        let keys: HashMap<AddressHex, &KeyPair> = address_keys
            .iter()
            .map(|key| (key.to_address(), key))
            .collect();

        let digest = self.content_digest();

        let mut input_signatures = Vec::new();
        for (position, line) in self.base_transactions.iter().enumerate() {
            if line.name != LineKind::Input {
                continue;
            }
            let key = keys
                .get(&line.address_hash)
                .ok_or_else(|| Error::MissingSigningKey(line.address_hash.to_string()))?;
            input_signatures.push((position, sign_digest(key, &digest)));
        }

        // Fee lines arrive hashed by the node
        for line in &mut self.base_transactions {
            if line.hash.is_none() {
                line.hash = Some(hex::encode(line.digest()));
            }
        }
        for (position, signature) in input_signatures {
            self.base_transactions[position].signature_data = Some(signature);
        }
        self.sender_signature = Some(sign_digest(user, &digest));
        let hash = hex::encode(digest);
        debug!("Signed transaction {}", hash);
        self.hash = Some(hash);

        Ok(())
    }

    /// Recompute the hash and check every signature
    pub fn verify(&self) -> Result<()> {
        let hash = self.hash.as_ref().ok_or(Error::NotSigned)?;
        let digest = self.content_digest();
        if hex::encode(digest) != *hash {
            return Err(Error::Validation(format!(
                "transaction {} was modified after signing",
                hash
            )));
        }

        for line in self.inputs() {
            let signature = line
                .signature_data
                .as_ref()
                .ok_or_else(|| Error::MissingSigningKey(line.address_hash.to_string()))?;
            if !verify_digest(line.address_hash.public_key_hex(), &digest, signature)? {
                return Err(Error::Validation(format!(
                    "bad input signature for {}",
                    line.address_hash
                )));
            }
        }

        let sender_signature = self.sender_signature.as_ref().ok_or(Error::NotSigned)?;
        if !verify_digest(&self.sender_hash, &digest, sender_signature)? {
            return Err(Error::Validation("bad sender signature".to_string()));
        }

        Ok(())
    }

    /// Tracked projection of a signed transaction, as Pending
    pub fn to_history_entry(&self) -> Result<HistoryEntry> {
        let hash = self.hash.clone().ok_or(Error::NotSigned)?;
        let mut reduced = ReducedTransaction::new(hash, self.create_time, None);
        if let Some(receiver) = self.receiver() {
            reduced.currency_hash = receiver.currency_hash.clone();
            reduced.original_currency_hash = receiver.original_currency_hash.clone();
        }
        Ok(HistoryEntry::new(reduced, self.addresses()))
    }
}
