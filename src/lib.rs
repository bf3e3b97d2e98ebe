//! # htlc-swap: EVM <-> Bitcoin Atomic Swap Library
//!
//! Bitcoin HTLC engine and cross-chain order state machine. One hashlock binds
//! a Bitcoin HTLC to an EVM escrow; revealing the secret on one chain lets the
//! counterparty claim on the other.

pub mod config;
pub mod error;
pub mod escrow;
pub mod htlc;
pub mod orders;
pub mod secret;
pub mod services;
pub mod steps;
pub mod transactions;
pub mod utils;

// Re-export commonly used types
pub use error::{NetworkError, SwapError, SwapResult};
pub use htlc::{HtlcConfig, HtlcOutput};
pub use orders::{Order, OrderStatus, OrderStore, SwapDirection};
pub use secret::{Hashlock, Secret};
pub use services::{AlloyEscrowClient, ChainGateway, EscrowClient, EsploraGateway};
