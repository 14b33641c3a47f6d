//! Transaction assembly: validation, fee quoting and input balancing
//!
//! Inputs are an ordered allocation of what each address may contribute.
//! Only what the spend (and possibly the fees) needs is taken; the rest of
//! each allocation stays unspent.

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::currency::{is_native, validate_currency_hash, HardForkFlag, MultiCurrency, NATIVE_CURRENCY_HASH};
use super::model::{BaseLine, LineKind, Transaction};
use crate::config::Network;
use crate::crypto::{AddressHex, KeyPair};
use crate::error::{Error, Result};
use crate::node::types::{FullNodeFeeRequest, NetworkFeeRequest};
use crate::node::{LedgerClient, TrustScoreGateway};
use crate::wallet::types::Amount;

/// What to send, from where, and who pays the fees
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub inputs: Vec<(AddressHex, Amount)>,
    pub destination: String,
    pub amount: Amount,
    pub fee_address: AddressHex,
    pub network: Network,
    pub multi_currency: Option<MultiCurrency>,
    pub description: Option<String>,
}

impl TransactionRequest {
    pub fn new(destination: impl Into<String>, amount: Amount, fee_address: AddressHex) -> Self {
        Self {
            inputs: Vec::new(),
            destination: destination.into(),
            amount,
            fee_address,
            network: Network::default(),
            multi_currency: None,
            description: None,
        }
    }

    /// Allow `address` to contribute up to `amount`
    pub fn input(mut self, address: AddressHex, amount: Amount) -> Self {
        self.inputs.push((address, amount));
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn multi_currency(mut self, multi_currency: MultiCurrency) -> Self {
        self.multi_currency = Some(multi_currency);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn total_inputs(&self) -> Amount {
        self.inputs.iter().map(|(_, amount)| *amount).sum()
    }
}

/// Fee lines quoted by the network for one spend
#[derive(Debug, Clone, PartialEq)]
pub struct FeeQuote {
    pub full_node_fee: BaseLine,
    pub network_fee: BaseLine,
}

impl FeeQuote {
    pub fn total(&self) -> Amount {
        self.full_node_fee.amount + self.network_fee.amount
    }
}

/// How lines are tagged
#[derive(Debug, Clone, PartialEq, Eq)]
enum CurrencyMode {
    Untagged,
    Tagged {
        currency_hash: String,
        original_currency_hash: String,
    },
}

impl CurrencyMode {
    fn spends_native(&self) -> bool {
        match self {
            CurrencyMode::Untagged => true,
            CurrencyMode::Tagged { currency_hash, .. } => is_native(currency_hash),
        }
    }

    fn tag_spend(&self, line: BaseLine) -> BaseLine {
        match self {
            CurrencyMode::Untagged => line,
            CurrencyMode::Tagged {
                currency_hash,
                original_currency_hash,
            } => line.with_currency(currency_hash, original_currency_hash),
        }
    }

    fn tag_fee(&self, mut line: BaseLine) -> BaseLine {
        match self {
            CurrencyMode::Untagged => {
                line.currency_hash = None;
                line.original_currency_hash = None;
                line
            }
            CurrencyMode::Tagged { .. } => {
                line.currency_hash = Some(NATIVE_CURRENCY_HASH.to_string());
                line.original_currency_hash = Some(NATIVE_CURRENCY_HASH.to_string());
                line
            }
        }
    }

    fn original_currency(&self) -> Option<String> {
        match self {
            CurrencyMode::Untagged => None,
            CurrencyMode::Tagged {
                original_currency_hash,
                ..
            } => Some(original_currency_hash.clone()),
        }
    }
}

/// Builds unsigned transactions against a node
pub struct TransactionBuilder {
    ledger: Arc<dyn LedgerClient>,
    trust: Arc<dyn TrustScoreGateway>,
}

impl TransactionBuilder {
    pub fn new(ledger: Arc<dyn LedgerClient>, trust: Arc<dyn TrustScoreGateway>) -> Self {
        Self { ledger, trust }
    }

    /// Validate, quote fees and balance `request` into an unsigned transaction
    pub async fn build(&self, request: &TransactionRequest, user: &KeyPair) -> Result<Transaction> {
        let destination = validate(request)?;

        if request.network != self.trust.network() {
            return Err(Error::Validation(format!(
                "request targets {} but the wallet is bound to {}",
                request.network,
                self.trust.network()
            )));
        }

        let mode = self.resolve_currency(request).await?;
        let quote = self.quote_fees(request.amount, &mode, user).await?;
        debug!(
            "Fee quote for {}: full node {}, network {}",
            request.amount, quote.full_node_fee.amount, quote.network_fee.amount
        );

        let create_time = Utc::now().trunc_subsecs(3);
        let tx = assemble(request, destination, &mode, quote, user.public_key_hex(), create_time)?;
        info!(
            "Built transaction of {} to {} with {} lines",
            request.amount,
            request.destination,
            tx.lines().len()
        );
        Ok(tx)
    }

    /// Fee lines for a spend of `amount`, without building anything
    pub async fn quote(&self, request: &TransactionRequest, user: &KeyPair) -> Result<FeeQuote> {
        let mode = self.resolve_currency(request).await?;
        self.quote_fees(request.amount, &mode, user).await
    }

    async fn resolve_currency(&self, request: &TransactionRequest) -> Result<CurrencyMode> {
        let node = self.ledger.get_hard_fork_status().await?;

        let Some(requested) = &request.multi_currency else {
            return Ok(match node {
                HardForkFlag::Legacy => CurrencyMode::Untagged,
                HardForkFlag::MultiCurrency => CurrencyMode::Tagged {
                    currency_hash: NATIVE_CURRENCY_HASH.to_string(),
                    original_currency_hash: NATIVE_CURRENCY_HASH.to_string(),
                },
            });
        };

        match (requested.hard_fork, node) {
            // A legacy request only opts out of tokens; the node decides tagging
            (HardForkFlag::Legacy, _) if !requested.is_native() => {
                Err(Error::UnsupportedCurrency(format!(
                    "{} cannot be sent without the multi-currency protocol",
                    requested.currency_hash
                )))
            }
            (HardForkFlag::Legacy, HardForkFlag::Legacy) => Ok(CurrencyMode::Untagged),
            (HardForkFlag::Legacy, HardForkFlag::MultiCurrency) => Ok(CurrencyMode::Tagged {
                currency_hash: NATIVE_CURRENCY_HASH.to_string(),
                original_currency_hash: NATIVE_CURRENCY_HASH.to_string(),
            }),
            (HardForkFlag::MultiCurrency, HardForkFlag::Legacy) => Err(Error::UnsupportedCurrency(
                format!(
                    "node has not activated multi-currency, cannot send {}",
                    requested.currency_hash
                ),
            )),
            (HardForkFlag::MultiCurrency, HardForkFlag::MultiCurrency) => {
                validate_currency_hash(&requested.currency_hash)?;
                validate_currency_hash(&requested.original_currency_hash)?;
                if !requested.is_native()
                    && self
                        .ledger
                        .get_token_details(&requested.currency_hash)
                        .await?
                        .is_none()
                {
                    return Err(Error::UnsupportedCurrency(format!(
                        "currency {} is unknown to the node",
                        requested.currency_hash
                    )));
                }
                Ok(CurrencyMode::Tagged {
                    currency_hash: requested.currency_hash.to_ascii_lowercase(),
                    original_currency_hash: requested.original_currency_hash.to_ascii_lowercase(),
                })
            }
        }
    }

    async fn quote_fees(&self, amount: Amount, mode: &CurrencyMode, user: &KeyPair) -> Result<FeeQuote> {
        let request = FullNodeFeeRequest::signed(amount, mode.original_currency(), user);
        let full_node_fee = mode.tag_fee(self.ledger.get_full_node_fee(&request).await?);

        let request = NetworkFeeRequest::signed(full_node_fee.clone(), user);
        let network_fee = mode.tag_fee(self.trust.get_network_fee(&request).await?);

        Ok(FeeQuote {
            full_node_fee,
            network_fee,
        })
    }
}

/// Local checks; nothing is sent if these fail. Returns the parsed destination.
fn validate(request: &TransactionRequest) -> Result<AddressHex> {
    if request.inputs.is_empty() {
        return Err(Error::Validation("at least one input is required".to_string()));
    }

    let mut seen = HashSet::new();
    for (address, amount) in &request.inputs {
        if !seen.insert(address) {
            return Err(Error::Validation(format!("duplicate input address {}", address)));
        }
        if *amount <= Amount::ZERO {
            return Err(Error::Validation(format!(
                "input amount for {} must be positive, got {}",
                address, amount
            )));
        }
    }

    if request.amount <= Amount::ZERO {
        return Err(Error::Validation(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }

    AddressHex::parse(&request.destination)
        .map_err(|e| Error::InvalidDestination(format!("{}: {}", request.destination, e)))
}

/// Balance inputs against outputs. Pure; all remote data is already in `quote`.
fn assemble(
    request: &TransactionRequest,
    destination: AddressHex,
    mode: &CurrencyMode,
    quote: FeeQuote,
    sender_hash: String,
    create_time: DateTime<Utc>,
) -> Result<Transaction> {
    let fee_total = quote.total();
    let fee_from_inputs = mode.spends_native()
        && request
            .inputs
            .iter()
            .any(|(address, _)| *address == request.fee_address);

    let required = if fee_from_inputs {
        request.amount + fee_total
    } else {
        request.amount
    };
    let available = request.total_inputs();
    if available < required {
        return Err(Error::InsufficientFunds {
            available,
            required,
        });
    }

    // Fee address pays first so the fee never splits across addresses needlessly
    let mut ordered: Vec<&(AddressHex, Amount)> = Vec::with_capacity(request.inputs.len());
    if fee_from_inputs {
        ordered.extend(request.inputs.iter().filter(|(a, _)| *a == request.fee_address));
    }
    ordered.extend(
        request
            .inputs
            .iter()
            .filter(|(a, _)| !fee_from_inputs || *a != request.fee_address),
    );

    let mut lines = Vec::new();
    let mut remaining = required;
    for (address, allowance) in ordered {
        if remaining.is_zero() {
            break;
        }
        let take = (*allowance).min(remaining);
        remaining -= take;
        lines.push(mode.tag_spend(BaseLine::new(
            address.clone(),
            -take,
            LineKind::Input,
            create_time,
        )));
    }

    if !fee_from_inputs && fee_total > Amount::ZERO {
        lines.push(mode.tag_fee(BaseLine::new(
            request.fee_address.clone(),
            -fee_total,
            LineKind::Input,
            create_time,
        )));
    }

    lines.push(mode.tag_spend(BaseLine::new(
        destination,
        request.amount,
        LineKind::Receiver,
        create_time,
    )));
    lines.push(quote.full_node_fee);
    lines.push(quote.network_fee);

    let tx = Transaction::unsigned(
        lines,
        create_time,
        request.description.clone().unwrap_or_default(),
        sender_hash,
    );

    if let Some((currency, sum)) = tx.sums_by_currency().into_iter().find(|(_, sum)| !sum.is_zero()) {
        return Err(Error::Internal(format!(
            "unbalanced transaction: {} left over in {}",
            sum,
            currency.as_deref().unwrap_or("native")
        )));
    }

    if let CurrencyMode::Tagged { .. } = mode {
        let native_funded = tx.inputs().any(|line| {
            line.original_currency_hash
                .as_deref()
                .map_or(false, is_native)
        });
        if fee_total > Amount::ZERO && !native_funded {
            return Err(Error::Validation(
                "fees must be covered by a native currency input".to_string(),
            ));
        }
    }

    Ok(tx)
}
