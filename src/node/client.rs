//! Full node client
//!
//! Every call is a single request/response; results are complete or the
//! call fails. Nothing here retries.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::types::*;
use crate::crypto::AddressHex;
use crate::error::{Error, Result};
use crate::transaction::currency::HardForkFlag;
use crate::transaction::model::{BaseLine, LineKind, SubmissionReceipt, Transaction};
use crate::wallet::types::{Balance, HistoryEntry};

/// Remote ledger operations used by the wallet
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Confirmed and pending balance for every requested address
    async fn get_balances(&self, addresses: &[AddressHex]) -> Result<HashMap<AddressHex, Balance>>;

    /// History touching any of `addresses`, ascending by create time
    async fn get_transaction_history(&self, addresses: &[AddressHex]) -> Result<Vec<HistoryEntry>>;

    async fn get_transaction(&self, hash: &str) -> Result<Option<HistoryEntry>>;

    /// Per-currency balances. Only available after the multi-currency hard fork.
    async fn get_token_balances(
        &self,
        addresses: &[AddressHex],
        currency_hash: Option<&str>,
    ) -> Result<HashMap<AddressHex, HashMap<String, Balance>>>;

    /// `None` if the node does not know the currency
    async fn get_token_details(&self, currency_hash: &str) -> Result<Option<TokenDetails>>;

    async fn get_full_node_fee(&self, request: &FullNodeFeeRequest) -> Result<BaseLine>;

    /// Refuses unsigned transactions locally
    async fn submit_transaction(&self, transaction: &Transaction) -> Result<SubmissionReceipt>;

    /// Protocol version of the node, fixed for the client's lifetime
    async fn get_hard_fork_status(&self) -> Result<HardForkFlag>;
}

/// Turn a node response into `T`, mapping failures onto the error taxonomy
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(status_error(status, &body));
    }

    // Some endpoints answer 200 with an error status in the body
    if let Ok(err) = serde_json::from_str::<ErrorResponse>(&body) {
        if err.status.eq_ignore_ascii_case("error") {
            return Err(Error::RejectedByNode(err.message));
        }
    }

    serde_json::from_str(&body).map_err(|e| Error::Deserialization(e.to_string()))
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status));

    if status.is_server_error() {
        Error::Network(message)
    } else {
        Error::RejectedByNode(message)
    }
}

fn parse_address_map<V>(raw: HashMap<String, V>) -> Result<HashMap<AddressHex, V>> {
    raw.into_iter()
        .map(|(hex, value)| Ok((AddressHex::parse(&hex)?, value)))
        .collect()
}

/// HTTP client for one full node
pub struct HttpLedgerClient {
    base_url: String,
    client: reqwest::Client,
    hard_fork: OnceCell<HardForkFlag>,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            hard_fork: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!("POST {}", path);
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        read_json(resp).await
    }

    async fn fetch_hard_fork(&self) -> Result<HardForkFlag> {
        let resp = self
            .client
            .get(self.url("/event/multi-dag/confirmed"))
            .send()
            .await?;
        let event: HardForkResponse = read_json(resp).await?;
        let flag = match event.event_transaction_data {
            Some(data) if !data.is_null() => HardForkFlag::MultiCurrency,
            _ => HardForkFlag::Legacy,
        };
        info!("Node {} runs protocol {}", self.base_url, flag);
        Ok(flag)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn get_balances(&self, addresses: &[AddressHex]) -> Result<HashMap<AddressHex, Balance>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let response: BalanceResponse = self
            .post("/balance", &AddressesRequest::new(addresses))
            .await?;
        let balances = parse_address_map(response.addresses_balance)?;

        // All or nothing
        let mut out = HashMap::with_capacity(addresses.len());
        for address in addresses {
            let dto = balances.get(address).ok_or_else(|| {
                Error::Deserialization(format!("node returned no balance for {}", address))
            })?;
            out.insert(address.clone(), Balance::from(*dto));
        }
        Ok(out)
    }

    async fn get_transaction_history(&self, addresses: &[AddressHex]) -> Result<Vec<HistoryEntry>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let response: HistoryResponse = self
            .post("/transaction/addressTransactions", &AddressesRequest::new(addresses))
            .await?;

        let mut entries: Vec<HistoryEntry> = response
            .transactions_data
            .into_iter()
            .map(TransactionDataDto::into_history_entry)
            .collect();
        entries.sort_by_key(|e| e.transaction.create_time);
        debug!("Fetched {} transactions for {} addresses", entries.len(), addresses.len());
        Ok(entries)
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<HistoryEntry>> {
        let request = TransactionRequest {
            transaction_hash: hash.to_string(),
        };
        let response: TransactionResponse = self.post("/transaction", &request).await?;
        Ok(response
            .transaction_data
            .map(TransactionDataDto::into_history_entry))
    }

    async fn get_token_balances(
        &self,
        addresses: &[AddressHex],
        currency_hash: Option<&str>,
    ) -> Result<HashMap<AddressHex, HashMap<String, Balance>>> {
        match self.get_hard_fork_status().await? {
            HardForkFlag::Legacy => {
                return Err(Error::UnsupportedCurrency(
                    "token balances require the multi-currency protocol".to_string(),
                ))
            }
            HardForkFlag::MultiCurrency => {}
        }

        let request = TokenBalancesRequest {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            currency_hash: currency_hash.map(str::to_string),
        };
        let response: TokenBalancesResponse = self
            .post("/currencies/token/balances", &request)
            .await?;

        let balances = parse_address_map(response.token_balances)?;
        Ok(balances
            .into_iter()
            .map(|(address, per_currency)| {
                let converted = per_currency
                    .into_iter()
                    .map(|(currency, dto)| (currency, Balance::from(dto)))
                    .collect();
                (address, converted)
            })
            .collect())
    }

    async fn get_token_details(&self, currency_hash: &str) -> Result<Option<TokenDetails>> {
        let request = TokenDetailsRequest {
            currency_hash: currency_hash.to_string(),
        };
        match self
            .post::<_, TokenDetailsResponse>("/currencies/token/details", &request)
            .await
        {
            Ok(response) => Ok(response.token),
            // Unknown tokens come back as a rejection
            Err(Error::RejectedByNode(message)) => {
                debug!("Token {} unknown to node: {}", currency_hash, message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_full_node_fee(&self, request: &FullNodeFeeRequest) -> Result<BaseLine> {
        let response: FullNodeFeeResponse = self.post("/fee", request).await?;
        if !expect_fee_line(&response.full_node_fee, LineKind::FullNodeFee) {
            return Err(Error::RejectedByNode(format!(
                "unexpected full node fee line: {:?}",
                response.full_node_fee.name
            )));
        }
        Ok(response.full_node_fee)
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<SubmissionReceipt> {
        let hash = transaction.hash().ok_or(Error::NotSigned)?.to_string();

        info!("Submitting transaction {}", hash);
        let resp = self
            .client
            .put(self.url("/transaction"))
            .json(transaction)
            .send()
            .await?;
        let response: SubmitResponse = read_json(resp).await?;

        Ok(SubmissionReceipt {
            hash,
            status: response.status,
            message: response.message,
        })
    }

    async fn get_hard_fork_status(&self) -> Result<HardForkFlag> {
        self.hard_fork
            .get_or_try_init(|| self.fetch_hard_fork())
            .await
            .copied()
    }
}
