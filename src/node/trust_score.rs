//! Trust score node and financial server gateway
//!
//! A user identity needs a trust score before its addresses may spend.
//! Registration goes through the financial server and happens once per seed.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

use super::client::{read_json, status_error};
use super::types::{InsertUserRequest, NetworkFeeRequest, NetworkFeeResponse, TrustScoreRequest};
use crate::config::Network;
use crate::error::{Error, Result};
use crate::transaction::model::{BaseLine, LineKind};
use crate::wallet::types::TrustScore;

const NOT_REGISTERED_MESSAGE: &str = "does not exist";
const API_KEY_HEADER: &str = "exchange-api-key";

#[async_trait]
pub trait TrustScoreGateway: Send + Sync {
    /// Fails with `UserNotRegistered` for unknown identities
    async fn get_trust_score(&self, user_hash: &str) -> Result<TrustScore>;

    /// Fails with `AlreadyRegistered` if the identity already has a score
    async fn register_trust_score(&self, api_key: &str, user_hash: &str) -> Result<TrustScore>;

    /// Network fee line for an already quoted full node fee
    async fn get_network_fee(&self, request: &NetworkFeeRequest) -> Result<BaseLine>;

    fn network(&self) -> Network;
}

/// HTTP gateway bound to one network
pub struct HttpTrustScoreGateway {
    trustscore_url: String,
    financial_server_url: String,
    network: Network,
    client: reqwest::Client,
}

impl HttpTrustScoreGateway {
    pub fn new(
        trustscore_url: impl Into<String>,
        financial_server_url: impl Into<String>,
        network: Network,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            trustscore_url: trustscore_url.into().trim_end_matches('/').to_string(),
            financial_server_url: financial_server_url.into().trim_end_matches('/').to_string(),
            network,
            client,
        })
    }
}

/// Distinguish "unknown identity" from other rejections
fn classify_lookup_error(user_hash: &str, err: Error) -> Error {
    match err {
        Error::RejectedByNode(message) if message.contains(NOT_REGISTERED_MESSAGE) => {
            Error::UserNotRegistered(user_hash.to_string())
        }
        other => other,
    }
}

fn classify_register_error(user_hash: &str, status: StatusCode, body: &str) -> Error {
    match status_error(status, body) {
        _ if status == StatusCode::CONFLICT => Error::AlreadyRegistered(user_hash.to_string()),
        Error::RejectedByNode(message) if message.to_ascii_lowercase().contains("exist") => {
            Error::AlreadyRegistered(user_hash.to_string())
        }
        other => other,
    }
}

#[async_trait]
impl TrustScoreGateway for HttpTrustScoreGateway {
    async fn get_trust_score(&self, user_hash: &str) -> Result<TrustScore> {
        let request = TrustScoreRequest {
            user_hash: user_hash.to_string(),
            network: self.network.to_string(),
        };
        let resp = self
            .client
            .post(format!("{}/usertrustscore", self.trustscore_url))
            .json(&request)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::UserNotRegistered(user_hash.to_string()));
        }

        let score: TrustScore = read_json(resp)
            .await
            .map_err(|e| classify_lookup_error(user_hash, e))?;
        debug!("Trust score for {}: {}", user_hash, score.trust_score);
        Ok(score)
    }

    async fn register_trust_score(&self, api_key: &str, user_hash: &str) -> Result<TrustScore> {
        if api_key.is_empty() {
            return Err(Error::Validation(
                "an api key is required to register a trust score".to_string(),
            ));
        }

        let request = InsertUserRequest::consumer(user_hash, self.network.as_str());
        let resp = self
            .client
            .put(format!("{}/admin/users/insert", self.financial_server_url))
            .header(API_KEY_HEADER, api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            return Err(classify_register_error(user_hash, status, &body));
        }

        info!("Registered user {} on {}", user_hash, self.network);
        self.get_trust_score(user_hash).await
    }

    async fn get_network_fee(&self, request: &NetworkFeeRequest) -> Result<BaseLine> {
        let resp = self
            .client
            .post(format!("{}/networkFee", self.trustscore_url))
            .json(request)
            .send()
            .await?;
        let response: NetworkFeeResponse = read_json(resp).await?;

        if response.network_fee_data.name != LineKind::NetworkFee {
            return Err(Error::RejectedByNode(format!(
                "unexpected network fee line: {:?}",
                response.network_fee_data.name
            )));
        }
        Ok(response.network_fee_data)
    }

    fn network(&self) -> Network {
        self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_registered_is_recognized() {
        let err = classify_lookup_error("u1", Error::RejectedByNode("User does not exist!".into()));
        assert!(err.is_not_registered());

        let err = classify_lookup_error("u1", Error::RejectedByNode("Invalid signature".into()));
        assert!(!err.is_not_registered());
    }

    #[test]
    fn test_duplicate_registration() {
        let err = classify_register_error("u1", StatusCode::CONFLICT, "");
        assert!(matches!(err, Error::AlreadyRegistered(_)));

        let body = r#"{"status":"Error","message":"User already exists"}"#;
        let err = classify_register_error("u1", StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, Error::AlreadyRegistered(_)));

        let err = classify_register_error("u1", StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_register_requires_api_key() {
        let gateway = HttpTrustScoreGateway::new(
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            Network::Testnet,
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(matches!(
            gateway.register_trust_score("", "u1").await,
            Err(Error::Validation(_))
        ));
        assert_eq!(gateway.network(), Network::Testnet);
    }
}
