//! # Services Module
//!
//! Network collaborators of the swap steps, each behind a trait so steps
//! can run against fakes in tests.
//!
//! ## Components
//!
//! - **Explorer Client**: Esplora-backed Bitcoin gateway with retries and a fallback transport
//! - **Escrow Client**: EVM escrow factory and escrow calls through alloy

pub mod escrow_client;
pub mod explorer_client;

pub use escrow_client::{AlloyEscrowClient, EscrowClient, EscrowDeployment};
pub use explorer_client::{
    resolve_fee_rate, ChainGateway, EsploraGateway, FeePriority, RecommendedFees, TxStatus,
};
