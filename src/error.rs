//! Error types for the wallet engine

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide how to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input shape or amount, detected locally and never sent to the network
    Validation,
    /// The node (or trust score service) refused the request
    RemoteRejection,
    /// Transient transport failure
    Network,
    /// Programmer error such as re-signing or duplicate registration
    StateConflict,
    /// Anything else (serialization, configuration, invariants)
    Internal,
}

/// Main error type for the wallet engine
#[derive(Error, Debug)]
pub enum Error {
    // Key material errors
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: Decimal, required: Decimal },

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("No signing key supplied for input address {0}")]
    MissingSigningKey(String),

    #[error("Transaction is not signed")]
    NotSigned,

    // Remote errors
    #[error("Rejected by node: {0}")]
    RejectedByNode(String),

    #[error("User {0} is not registered with the trust score node")]
    UserNotRegistered(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    // State conflicts
    #[error("Transaction {0} is already signed")]
    AlreadySigned(String),

    #[error("User {0} already has a trust score")]
    AlreadyRegistered(String),

    #[error("Event stream is not connected (state: {0})")]
    StreamNotConnected(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Stream errors
    #[error("Stream connection failed: {0}")]
    StreamConnection(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSeed(_)
            | Error::InvalidKey(_)
            | Error::InvalidAddress(_)
            | Error::Validation(_)
            | Error::InvalidDestination(_)
            | Error::InsufficientFunds { .. }
            | Error::UnsupportedCurrency(_)
            | Error::MissingSigningKey(_)
            | Error::NotSigned => ErrorKind::Validation,
            Error::RejectedByNode(_) | Error::UserNotRegistered(_) => ErrorKind::RemoteRejection,
            Error::Network(_) | Error::Timeout(_) | Error::StreamConnection(_) => ErrorKind::Network,
            Error::AlreadySigned(_)
            | Error::AlreadyRegistered(_)
            | Error::StreamNotConnected(_)
            | Error::InvalidState(_) => ErrorKind::StateConflict,
            Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// The trust score node does not know this identity yet.
    /// Expected on first use of a seed; triggers registration.
    pub fn is_not_registered(&self) -> bool {
        matches!(self, Error::UserNotRegistered(_))
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_decode() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from secp256k1 errors
impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::InvalidKey(e.to_string())
    }
}

// Conversion from websocket errors
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::StreamConnection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::InsufficientFunds {
                available: Decimal::ONE,
                required: Decimal::TWO,
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::RejectedByNode("bad".into()).kind(), ErrorKind::RemoteRejection);
        assert_eq!(Error::AlreadySigned("abc".into()).kind(), ErrorKind::StateConflict);
        assert_eq!(Error::AlreadyRegistered("abc".into()).kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn test_retryable_only_for_network() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout("30s".into()).is_retryable());
        assert!(!Error::RejectedByNode("stale input".into()).is_retryable());
        assert!(!Error::UserNotRegistered("u".into()).is_retryable());
    }

    #[test]
    fn test_not_registered_is_distinguished() {
        assert!(Error::UserNotRegistered("u".into()).is_not_registered());
        assert!(!Error::RejectedByNode("User does not exist!".into()).is_not_registered());
    }
}
