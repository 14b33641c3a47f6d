//! Event stream frames

use serde::{Deserialize, Serialize};

use crate::crypto::AddressHex;
use crate::error::{Error, Result};
use crate::wallet::types::{Amount, Balance, HistoryEntry, ReducedTransaction};

/// Frame pushed by the node
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundFrame {
    BalanceChanged(BalancePayload),
    TransactionChanged(TransactionPayload),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancePayload {
    pub address: AddressHex,
    pub balance: Amount,
    pub pre_balance: Amount,
}

impl BalancePayload {
    pub fn balances(&self) -> Balance {
        Balance::new(self.balance, self.pre_balance)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPayload {
    #[serde(flatten)]
    pub transaction: ReducedTransaction,
    #[serde(default)]
    pub addresses: Vec<AddressHex>,
}

impl From<TransactionPayload> for HistoryEntry {
    fn from(payload: TransactionPayload) -> Self {
        HistoryEntry::new(payload.transaction, payload.addresses)
    }
}

/// Frame sent to the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    Subscribe { address: String },
}

impl OutboundFrame {
    pub fn subscribe(address: &AddressHex) -> Self {
        OutboundFrame::Subscribe {
            address: address.to_string(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn parse_inbound(text: &str) -> Result<InboundFrame> {
    serde_json::from_str(text).map_err(|e| Error::Deserialization(format!("bad frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_address_key_pair, Seed};
    use crate::wallet::types::TransactionStatus;

    fn address() -> AddressHex {
        let seed = Seed::from_bytes(&[31u8; 32]).unwrap();
        derive_address_key_pair(&seed, 0).unwrap().to_address()
    }

    #[test]
    fn test_balance_frame() {
        let text = format!(
            r#"{{"type":"BalanceChanged","payload":{{"address":"{}","balance":4.5,"preBalance":3}}}}"#,
            address()
        );
        match parse_inbound(&text).unwrap() {
            InboundFrame::BalanceChanged(p) => {
                assert_eq!(p.address, address());
                assert_eq!(p.balances(), Balance::new(Amount::new(45, 1), Amount::from(3)));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_transaction_frame() {
        let text = format!(
            r#"{{"type":"TransactionChanged","payload":{{"hash":"aa","createTime":1600000000.25,"status":"CONFIRMED","addresses":["{}"]}}}}"#,
            address()
        );
        match parse_inbound(&text).unwrap() {
            InboundFrame::TransactionChanged(p) => {
                let entry = HistoryEntry::from(p);
                assert_eq!(entry.transaction.status, TransactionStatus::Confirmed);
                assert_eq!(entry.addresses, vec![address()]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"type":"Unknown","payload":{}}"#).is_err());
        assert!(parse_inbound(
            r#"{"type":"BalanceChanged","payload":{"address":"zz","balance":1,"preBalance":1}}"#
        )
        .is_err());
    }

    #[test]
    fn test_subscribe_frame() {
        let text = OutboundFrame::subscribe(&address()).to_text().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["address"], address().to_string());
    }
}
