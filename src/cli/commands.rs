//! CLI command implementations

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crypto::{derive_address_key_pair, derive_user_key_pair, AddressHex, KeyPair, Seed};
use crate::stream::WebSocketConnector;
use crate::transaction::{MultiCurrency, TransactionRequest};
use crate::wallet::types::{Amount, TransactionStatus};
use crate::wallet::Wallet;

/// Arguments of the `send` command
#[derive(Debug, Clone)]
pub struct SendArgs {
    pub to: String,
    pub amount: String,
    pub from: Vec<u32>,
    pub currency: Option<String>,
    pub description: String,
    pub dry_run: bool,
}

/// Parse a seed given as a BIP39 phrase or as hex
pub fn parse_seed(input: &str) -> Result<Seed> {
    let input = input.trim();
    let seed = if input.contains(char::is_whitespace) {
        Seed::from_mnemonic(input)?
    } else {
        Seed::from_hex(input)?
    };
    Ok(seed)
}

/// Generate a new recovery phrase
pub fn mnemonic() -> Result<()> {
    let phrase = Seed::generate_mnemonic()?;
    println!("{}", phrase);
    eprintln!("Write this phrase down and keep it offline. Anyone holding it controls the wallet.");
    Ok(())
}

/// Show the user hash and the first `count` addresses of a seed
pub fn derive(config: &Config, seed: &str, count: Option<u32>) -> Result<()> {
    let seed = parse_seed(seed)?;
    let user = derive_user_key_pair(&seed)?;
    let count = count.unwrap_or(config.wallet.address_count);

    println!("\n=== WALLET ({}) ===\n", config.network);
    println!("User hash: {}", user.public_key_hex());
    println!();
    println!("{:<6} {}", "Index", "Address");
    println!("{}", "-".repeat(140));
    for index in 0..count {
        let address = derive_address_key_pair(&seed, index)?.to_address();
        println!("{:<6} {}", index, address);
    }
    Ok(())
}

/// Fetch balances of the derived addresses
pub async fn balance(config: &Config, seed: &str, count: Option<u32>, tokens: bool) -> Result<()> {
    let seed = parse_seed(seed)?;
    let wallet = open_wallet(config, &seed, &indices(config, count)).await?;

    println!("\n=== BALANCES ({}) ===\n", config.network);
    println!("{:<6} {:>20} {:>20}  {}", "Index", "Balance", "Pending", "Address");
    println!("{}", "-".repeat(180));
    for address in wallet.addresses().await {
        println!(
            "{:<6} {:>20} {:>20}  {}",
            address.index().map(|i| i.to_string()).unwrap_or_default(),
            address.balance(),
            address.pending_balance(),
            address.hex()
        );
    }

    let total = wallet.total_balance().await;
    println!("\nTotal: {} (pending {})", total.balance, total.pending_balance);

    if tokens {
        match wallet.token_balances(None).await {
            Ok(by_address) => {
                println!("\n=== TOKENS ===\n");
                for (address, currencies) in by_address {
                    for (currency, balance) in currencies {
                        println!(
                            "{}  {}  {} (pending {})",
                            address, currency, balance.balance, balance.pending_balance
                        );
                    }
                }
            }
            Err(e) => warn!("Token balances unavailable: {}", e),
        }
    }
    Ok(())
}

/// Fetch the transaction history of the derived addresses
pub async fn history(config: &Config, seed: &str, count: Option<u32>, limit: usize) -> Result<()> {
    let seed = parse_seed(seed)?;
    let wallet = open_wallet(config, &seed, &indices(config, count)).await?;

    let mut transactions = wallet.check_transaction_history().await?;
    transactions.sort_by(|a, b| b.create_time.cmp(&a.create_time));

    println!("\n=== TRANSACTION HISTORY ===\n");
    if transactions.is_empty() {
        println!("No transactions found.");
        return Ok(());
    }

    println!("{:<25} {:<10} {}", "Time", "Status", "Hash");
    println!("{}", "-".repeat(100));
    for tx in transactions.iter().take(limit) {
        println!(
            "{:<25} {:<10} {}",
            tx.create_time.format("%Y-%m-%d %H:%M:%S%.3f"),
            tx.status.to_string(),
            tx.hash
        );
    }

    let pending = transactions
        .iter()
        .filter(|tx| tx.status == TransactionStatus::Pending)
        .count();
    println!("\n{} transactions, {} pending", transactions.len(), pending);
    Ok(())
}

/// Look up the trust score, registering the user on first use
pub async fn trust_score(config: &Config, seed: &str) -> Result<()> {
    let seed = parse_seed(seed)?;
    let user = derive_user_key_pair(&seed)?;
    let wallet = Wallet::from_config(config)?;

    let score = wallet.ensure_trust_score(&user).await?;
    println!("User hash:   {}", score.user_hash);
    println!("Trust score: {}", score.trust_score);
    Ok(())
}

/// Print live balance and transaction events until Ctrl+C
pub async fn watch(config: &Config, seed: &str, count: Option<u32>) -> Result<()> {
    let seed = parse_seed(seed)?;
    let wallet = open_wallet(config, &seed, &indices(config, count)).await?;
    wallet.check_transaction_history().await?;

    wallet.on_balance_change(|address| {
        println!(
            "[balance] {}  {} (pending {})",
            address.hex(),
            address.balance(),
            address.pending_balance()
        );
    });
    wallet.on_transaction(|tx| {
        println!("[transaction] {}  {}", tx.hash, tx.status);
    });

    let (failed_tx, failed_rx) = oneshot::channel();
    let stream = wallet.connect_stream(
        &config.ws_url(),
        &config.stream,
        Arc::new(WebSocketConnector),
        || info!("Event stream connected"),
        move |e| {
            let _ = failed_tx.send(e);
        },
    )?;

    info!("Watching {} addresses. Press Ctrl+C to stop.", wallet.addresses().await.len());

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
        Ok(e) = failed_rx => {
            error!("Event stream gave up: {}", e);
            Err(anyhow::anyhow!("event stream failed: {}", e))
        }
    };

    wallet.close_stream();
    stream.join().await;
    result
}

/// Build, sign and submit a transfer
pub async fn send(config: &Config, seed: &str, args: SendArgs) -> Result<()> {
    let seed = parse_seed(seed)?;
    let amount: Amount = args
        .amount
        .parse()
        .with_context(|| format!("Invalid amount '{}'", args.amount))?;
    if args.from.is_empty() {
        anyhow::bail!("At least one source address index is required");
    }

    let user = derive_user_key_pair(&seed)?;
    let keys: Vec<KeyPair> = args
        .from
        .iter()
        .map(|&index| derive_address_key_pair(&seed, index))
        .collect::<crate::error::Result<_>>()?;

    let wallet = open_wallet(config, &seed, &args.from).await?;
    wallet.ensure_trust_score(&user).await?;

    let mut balances = Vec::with_capacity(keys.len());
    for key in &keys {
        let hex = key.to_address();
        let available = wallet
            .address(&hex)
            .await
            .map(|a| a.balance())
            .unwrap_or_default();
        balances.push((hex, available));
    }
    let inputs = funded_inputs(balances)?;

    // Whole balances are offered; whatever the transfer doesn't need stays put
    let fee_address = inputs[0].0.clone();
    let mut request = TransactionRequest::new(args.to.clone(), amount, fee_address)
        .network(config.network)
        .description(args.description.clone());
    for (hex, available) in inputs {
        request = request.input(hex, available);
    }
    if let Some(currency) = &args.currency {
        request = request.multi_currency(MultiCurrency::token(currency.clone()));
    }

    let mut transaction = wallet.build_transaction(&request, &user).await?;

    println!("\n=== TRANSFER ===\n");
    println!("{:<12} {:>20}  {}", "Line", "Amount", "Address");
    println!("{}", "-".repeat(170));
    for line in transaction.lines() {
        println!(
            "{:<12} {:>20}  {}",
            format!("{:?}", line.name),
            line.amount,
            line.address_hash
        );
    }

    if args.dry_run {
        warn!("DRY RUN - transaction not signed or submitted");
        return Ok(());
    }

    transaction.sign(&user, &keys)?;
    let receipt = wallet.submit(&transaction).await?;
    println!("\nSubmitted {}: {}", receipt.hash, receipt.status);
    if let Some(message) = receipt.message {
        println!("{}", message);
    }
    Ok(())
}

/// Show configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Inputs with a confirmed balance, in the order given. The first one pays the fees.
fn funded_inputs(balances: Vec<(AddressHex, Amount)>) -> Result<Vec<(AddressHex, Amount)>> {
    let mut funded = Vec::with_capacity(balances.len());
    for (hex, available) in balances {
        if available.is_zero() {
            warn!("Skipping {}: no confirmed balance", hex);
            continue;
        }
        funded.push((hex, available));
    }
    if funded.is_empty() {
        anyhow::bail!("None of the source addresses has a confirmed balance");
    }
    Ok(funded)
}

fn indices(config: &Config, count: Option<u32>) -> Vec<u32> {
    (0..count.unwrap_or(config.wallet.address_count)).collect()
}

/// Wallet tracking the given derived addresses, balances fetched
async fn open_wallet(config: &Config, seed: &Seed, indices: &[u32]) -> Result<Wallet> {
    let wallet = Wallet::from_config(config)?;
    for &index in indices {
        wallet.generate_address(seed, index).await?;
    }
    Ok(wallet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_hex() {
        let hex = "11".repeat(32);
        let seed = parse_seed(&hex).unwrap();
        assert_eq!(seed.to_hex(), hex);
    }

    #[test]
    fn test_parse_seed_mnemonic() {
        let phrase = Seed::generate_mnemonic().unwrap();
        let a = parse_seed(&phrase).unwrap();
        let b = parse_seed(&format!("  {}\n", phrase)).unwrap();
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn test_parse_seed_rejects_garbage() {
        assert!(parse_seed("abc").is_err());
        assert!(parse_seed("not a valid phrase at all").is_err());
    }

    fn hex(index: u32) -> AddressHex {
        let seed = Seed::from_bytes(&[31u8; 32]).unwrap();
        derive_address_key_pair(&seed, index).unwrap().to_address()
    }

    #[test]
    fn test_fee_paid_by_first_funded_input() {
        let inputs = funded_inputs(vec![
            (hex(0), Amount::ZERO),
            (hex(1), Amount::from(4)),
            (hex(2), Amount::from(9)),
        ])
        .unwrap();

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].0, hex(1));
        assert_eq!(inputs[1], (hex(2), Amount::from(9)));
    }

    #[test]
    fn test_no_funded_input_is_an_error() {
        assert!(funded_inputs(vec![(hex(0), Amount::ZERO), (hex(1), Amount::ZERO)]).is_err());
        assert!(funded_inputs(Vec::new()).is_err());
    }

    #[test]
    fn test_indices_default_to_config() {
        let mut config = Config::default();
        config.wallet.address_count = 3;
        assert_eq!(indices(&config, None), vec![0, 1, 2]);
        assert_eq!(indices(&config, Some(1)), vec![0]);
    }
}
