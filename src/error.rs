//! # Error Types for HTLC Swaps
//!
//! This module provides the error taxonomy for every swap step: secret and
//! hashlock checks, Bitcoin transaction construction, order state transitions,
//! and the network collaborators on both chains.

use thiserror::Error;

/// Main error type for all swap operations
#[derive(Debug, Error)]
pub enum SwapError {
    /// The revealed secret does not hash to the recorded hashlock
    #[error("Secret mismatch: expected hashlock {expected}, computed {computed}")]
    SecretMismatch { expected: String, computed: String },

    /// Available UTXO value or an output amount is insufficient after fees
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    /// A produced signature is not strict-DER or not low-S
    #[error("Non-canonical signature: {reason}")]
    NonCanonicalSignature { reason: String },

    /// Illegal order transition, or a required field is missing
    #[error("Invalid order state for {order_id} (status {status}): {reason}")]
    InvalidOrderState {
        order_id: String,
        status: String,
        reason: String,
    },

    /// No usable secret in a spending transaction
    #[error("Secret not found: {reason}")]
    SecretNotFound { reason: String },

    /// Gateway request failed after all retries and transports
    #[error("Network request failed: {source}")]
    Network {
        #[from]
        source: NetworkError,
    },

    /// Unsupported or malformed Bitcoin address
    #[error("Invalid address {address}: {reason}")]
    AddressFormat { address: String, reason: String },

    /// Settings or order parameters are invalid
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Key parsing, signing or hashing failures
    #[error("Cryptographic operation failed: {message}")]
    Cryptography { message: String },

    /// Errors during transaction construction or decoding
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// EVM escrow contract call failures
    #[error("Escrow call {operation} failed: {message}")]
    Escrow { operation: String, message: String },

    /// No persisted order with this identifier
    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    /// File I/O operations
    #[error("File operation failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Result type alias for swap operations
pub type SwapResult<T> = Result<T, SwapError>;

impl SwapError {
    /// Configuration error from any message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cryptography error with a message
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Cryptography {
            message: message.into(),
        }
    }

    /// Create a transaction construction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn escrow(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Escrow {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AddressFormat {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn non_canonical(reason: impl Into<String>) -> Self {
        Self::NonCanonicalSignature {
            reason: reason.into(),
        }
    }

    pub fn secret_not_found(reason: impl Into<String>) -> Self {
        Self::SecretNotFound {
            reason: reason.into(),
        }
    }

    /// True when the failure came from the gateway and the step can be rerun
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwapError::Network { .. })
    }

    /// Check if this error is a cryptographic or state-machine violation.
    ///
    /// These must halt the current step; no fallback is attempted.
    pub fn is_fatal_invariant(&self) -> bool {
        matches!(
            self,
            SwapError::SecretMismatch { .. }
                | SwapError::NonCanonicalSignature { .. }
                | SwapError::InvalidOrderState { .. }
                | SwapError::SecretNotFound { .. }
                | SwapError::InsufficientFunds { .. }
        )
    }
}

/// Bitcoin gateway transport errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Non-success HTTP status
    #[error("HTTP request to {url} failed: {status} - {message}")]
    HttpError {
        url: String,
        status: u16,
        message: String,
    },

    /// Connection, timeout or body read failures
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// API response validation errors
    #[error("Invalid API response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    /// Every transport failed for this operation
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

/// Result type alias for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Check whether another attempt could succeed.
    ///
    /// Client errors (4xx) are deterministic rejections, e.g. a refund
    /// broadcast before its locktime, and are not retried.
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::HttpError { status, .. } => *status >= 500 || *status == 429,
            NetworkError::Request { .. } => true,
            NetworkError::InvalidResponse { .. } => true,
            NetworkError::Exhausted { .. } => false,
        }
    }
}
