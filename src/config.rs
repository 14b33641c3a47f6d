//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Coti network an engine instance is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    #[default]
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            other => anyhow::bail!("Unknown network '{}', expected mainnet or testnet", other),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

/// Endpoints of the remote services. Unset URLs fall back to the network's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub fullnode_url: Option<String>,
    #[serde(default)]
    pub trustscore_url: Option<String>,
    #[serde(default)]
    pub financial_server_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Financial server key, needed once per seed to register a trust score
    #[serde(default)]
    pub api_key: String,
    /// Number of addresses the CLI derives by default
    #[serde(default = "default_address_count")]
    pub address_count: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            address_count: default_address_count(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_initial_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_address_count() -> u32 {
    1
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .set_default("network", Network::default().as_str())?
            .set_default("node.timeout_ms", default_timeout_ms() as i64)?
            .set_default(
                "stream.max_reconnect_attempts",
                default_max_reconnect_attempts() as i64,
            )?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix COTI__)
            .add_source(
                config::Environment::with_prefix("COTI")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("fullnode_url", self.fullnode_url()),
            ("trustscore_url", self.trustscore_url()),
            ("financial_server_url", self.financial_server_url()),
            ("ws_url", self.ws_url()),
        ] {
            url::Url::parse(&url).with_context(|| format!("Invalid {}: {}", name, url))?;
        }

        if self.node.timeout_ms == 0 {
            anyhow::bail!("node.timeout_ms must be positive");
        }

        if self.stream.reconnect_initial_delay_ms == 0 {
            anyhow::bail!("stream.reconnect_initial_delay_ms must be positive");
        }

        if self.stream.reconnect_max_delay_ms < self.stream.reconnect_initial_delay_ms {
            anyhow::bail!(
                "stream.reconnect_max_delay_ms ({}) is below the initial delay ({})",
                self.stream.reconnect_max_delay_ms,
                self.stream.reconnect_initial_delay_ms
            );
        }

        if self.stream.ping_interval_secs == 0 {
            anyhow::bail!("stream.ping_interval_secs must be positive");
        }

        if self.wallet.api_key.is_empty() {
            tracing::debug!("No financial server api key set; trust score registration is disabled");
        }

        Ok(())
    }

    pub fn fullnode_url(&self) -> String {
        self.node
            .fullnode_url
            .clone()
            .unwrap_or_else(|| format!("https://{}-fullnode1.coti.io", self.network))
    }

    pub fn trustscore_url(&self) -> String {
        self.node
            .trustscore_url
            .clone()
            .unwrap_or_else(|| format!("https://{}-trustscore1.coti.io", self.network))
    }

    pub fn financial_server_url(&self) -> String {
        self.node
            .financial_server_url
            .clone()
            .unwrap_or_else(|| format!("https://{}-financialserver.coti.io", self.network))
    }

    pub fn ws_url(&self) -> String {
        self.stream
            .ws_url
            .clone()
            .unwrap_or_else(|| format!("wss://{}-fullnode1.coti.io/websocket", self.network))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.node.timeout_ms)
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Network: {}
  Node:
    fullnode: {}
    trustscore: {}
    financial_server: {}
    timeout: {}ms
  Stream:
    ws_url: {}
    reconnect_delay: {}ms..{}ms
    max_reconnect_attempts: {}
    ping_interval: {}s
  Wallet:
    api_key: {}
    address_count: {}
"#,
            self.network,
            mask_url(&self.fullnode_url()),
            mask_url(&self.trustscore_url()),
            mask_url(&self.financial_server_url()),
            self.node.timeout_ms,
            mask_url(&self.ws_url()),
            self.stream.reconnect_initial_delay_ms,
            self.stream.reconnect_max_delay_ms,
            self.stream.max_reconnect_attempts,
            self.stream.ping_interval_secs,
            if self.wallet.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.wallet.address_count,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            node: NodeConfig {
                timeout_ms: default_timeout_ms(),
                ..NodeConfig::default()
            },
            stream: StreamConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.fullnode_url(), "https://testnet-fullnode1.coti.io");
        assert_eq!(config.ws_url(), "wss://testnet-fullnode1.coti.io/websocket");
        assert_eq!(config.stream.max_reconnect_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
network = "mainnet"

[node]
fullnode_url = "http://localhost:7070"

[stream]
max_reconnect_attempts = 3

[wallet]
api_key = "secret"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.fullnode_url(), "http://localhost:7070");
        assert_eq!(config.trustscore_url(), "https://mainnet-trustscore1.coti.io");
        assert_eq!(config.stream.max_reconnect_attempts, 3);
        assert_eq!(config.stream.ping_interval_secs, 30);
        assert!(config.masked_display().contains("api_key: ***"));
        assert!(!config.masked_display().contains("secret"));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.stream.reconnect_max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("MAINNET".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("devnet".parse::<Network>().is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(mask_url("https://api.example.com"), "https://api.example.com");
    }
}
