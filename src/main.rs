//! Coti Wallet - command line front end for the wallet engine
//!
//! Seeds are read from `--seed` or the `COTI_SEED` environment variable,
//! either as a BIP39 phrase or as 32 hex-encoded bytes.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

// Use the library crate
use coti_wallet::cli::commands;
use coti_wallet::config::Config;

/// Coti Wallet - key derivation, balances, history and transfers
#[derive(Parser)]
#[command(name = "coti-wallet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new 12-word seed phrase
    Mnemonic,

    /// Show the user hash and derived addresses of a seed
    Derive {
        /// Seed phrase or hex seed
        #[arg(long, env = "COTI_SEED", hide_env_values = true)]
        seed: String,

        /// Number of addresses to derive (defaults to wallet.address_count)
        #[arg(short, long)]
        count: Option<u32>,
    },

    /// Fetch balances of derived addresses
    Balance {
        #[arg(long, env = "COTI_SEED", hide_env_values = true)]
        seed: String,

        #[arg(short, long)]
        count: Option<u32>,

        /// Also show token balances (multi-currency nodes)
        #[arg(long)]
        tokens: bool,
    },

    /// Fetch transaction history of derived addresses
    History {
        #[arg(long, env = "COTI_SEED", hide_env_values = true)]
        seed: String,

        #[arg(short, long)]
        count: Option<u32>,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Look up the trust score, registering the user if needed
    TrustScore {
        #[arg(long, env = "COTI_SEED", hide_env_values = true)]
        seed: String,
    },

    /// Stream live balance and transaction events
    Watch {
        #[arg(long, env = "COTI_SEED", hide_env_values = true)]
        seed: String,

        #[arg(short, long)]
        count: Option<u32>,
    },

    /// Send coti (or a token) from derived addresses
    Send {
        #[arg(long, env = "COTI_SEED", hide_env_values = true)]
        seed: String,

        /// Destination address
        #[arg(long)]
        to: String,

        /// Amount to send
        #[arg(long)]
        amount: String,

        /// Address indices to spend from (the first funded one also pays the fees)
        #[arg(long, value_delimiter = ',', default_value = "0")]
        from: Vec<u32>,

        /// Token currency hash (native coti when omitted)
        #[arg(long)]
        currency: Option<String>,

        /// Transaction description
        #[arg(long, default_value = "")]
        description: String,

        /// Quote fees only, don't sign or submit
        #[arg(long)]
        dry_run: bool,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coti_wallet=info")),
        )
        .with_target(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("Using {} network", config.network);

    // Execute command
    let result = match cli.command {
        Commands::Mnemonic => commands::mnemonic(),
        Commands::Derive { seed, count } => commands::derive(&config, &seed, count),
        Commands::Balance {
            seed,
            count,
            tokens,
        } => commands::balance(&config, &seed, count, tokens).await,
        Commands::History { seed, count, limit } => {
            commands::history(&config, &seed, count, limit).await
        }
        Commands::TrustScore { seed } => commands::trust_score(&config, &seed).await,
        Commands::Watch { seed, count } => commands::watch(&config, &seed, count).await,
        Commands::Send {
            seed,
            to,
            amount,
            from,
            currency,
            description,
            dry_run,
        } => {
            let args = commands::SendArgs {
                to,
                amount,
                from,
                currency,
                description,
                dry_run,
            };
            commands::send(&config, &seed, args).await
        }
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
