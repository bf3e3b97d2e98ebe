//! # Configuration
//!
//! Constant modules used throughout the swap engine, plus [`SwapSettings`],
//! the runtime settings resolved from the environment (and `.env`).

use crate::error::{SwapError, SwapResult};
use bitcoin::Network;
use std::env as std_env;
use std::path::PathBuf;

/// Network and gateway configuration
pub mod network {
    use std::time::Duration;

    /// Primary Bitcoin API for mainnet
    pub const MAINNET_API_BASE: &str = "https://mempool.space/api";

    /// Primary Bitcoin API for testnet
    pub const TESTNET_API_BASE: &str = "https://mempool.space/testnet/api";

    /// Primary Bitcoin API for signet
    pub const SIGNET_API_BASE: &str = "https://mempool.space/signet/api";

    /// Local esplora for regtest
    pub const REGTEST_API_BASE: &str = "http://127.0.0.1:3002";

    /// Fallback transport for mainnet
    pub const MAINNET_FALLBACK_API_BASE: &str = "https://blockstream.info/api";

    /// Fallback transport for testnet
    pub const TESTNET_FALLBACK_API_BASE: &str = "https://blockstream.info/testnet/api";

    /// Fallback transport for signet
    pub const SIGNET_FALLBACK_API_BASE: &str = "https://mutinynet.com/api";

    /// Request timeout for network operations
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Attempts per transport before falling back
    pub const MAX_RETRY_ATTEMPTS: u32 = 3;

    /// Base delay for exponential backoff
    pub const RETRY_DELAY: Duration = Duration::from_millis(500);
}

/// Fee and size constants
///
/// Sizes are conservative virtual-byte estimates per transaction shape. They
/// are fixed so fees are reproducible from the inputs alone.
pub mod fees {
    /// Outputs at or below this value are not created
    pub const DUST_THRESHOLD_SATS: u64 = 546;

    /// Fallback fee rate when no estimate is available (sat/vB)
    pub const DEFAULT_FEE_RATE: f64 = 5.0;

    /// Version, locktime, counts and segwit marker
    pub const TX_OVERHEAD_VBYTES: u64 = 11;

    /// P2WPKH input including its witness
    pub const P2WPKH_INPUT_VBYTES: u64 = 68;

    /// P2PKH input with a 72-byte signature and compressed key
    pub const P2PKH_INPUT_VBYTES: u64 = 148;

    /// Largest standard output we create (P2WSH)
    pub const OUTPUT_VBYTES: u64 = 43;

    /// Claim of a P2WSH HTLC: signature, secret, selector and script
    pub const SEGWIT_CLAIM_VBYTES: u64 = 200;

    /// Refund of a P2WSH HTLC: signature, selector and script
    pub const SEGWIT_REFUND_VBYTES: u64 = 190;

    /// Claim of a P2SH HTLC with everything in the scriptSig
    pub const LEGACY_CLAIM_VBYTES: u64 = 350;

    /// Refund of a P2SH HTLC with everything in the scriptSig
    pub const LEGACY_REFUND_VBYTES: u64 = 320;
}

/// Default swap timing parameters
pub mod timelocks {
    /// Private withdrawal window on the EVM escrow (seconds after deployment)
    pub const DEFAULT_WITHDRAWAL_SECS: u32 = 60;

    /// Public withdrawal window on the EVM escrow (seconds after deployment)
    pub const DEFAULT_PUBLIC_WITHDRAWAL_SECS: u32 = 1_800;

    /// Cancellation window on the EVM escrow (seconds after deployment)
    pub const DEFAULT_CANCELLATION_SECS: u32 = 3_600;

    /// Bitcoin HTLC lifetime added to the current time for the CLTV locktime
    pub const DEFAULT_BTC_LOCK_SECS: u32 = 7_200;
}

/// File paths and names
pub mod files {
    /// Directory holding one JSON record per order
    pub const DEFAULT_ORDERS_DIR: &str = "./orders";

    /// Extension for in-flight writes before the atomic rename
    pub const TEMP_EXTENSION: &str = "json.tmp";
}

/// Display settings for CLI output
pub mod ui {
    pub const ADDRESS_DISPLAY_PREFIX: usize = 8;
    pub const ADDRESS_DISPLAY_SUFFIX: usize = 6;
    pub const TXID_DISPLAY_PREFIX: usize = 8;
    pub const TXID_DISPLAY_SUFFIX: usize = 8;
}

/// Environment variable names
pub mod env {
    pub const ORDER_ID: &str = "ORDER_ID";
    pub const ORDERS_DIR: &str = "ORDERS_DIR";
    pub const BTC_NETWORK: &str = "BTC_NETWORK";
    pub const BTC_PRIVATE_KEY: &str = "BTC_PRIVATE_KEY";
    pub const BTC_FEE_RATE: &str = "BTC_FEE_RATE";
    pub const BTC_API_URL: &str = "BTC_API_URL";
    pub const BTC_FALLBACK_API_URL: &str = "BTC_FALLBACK_API_URL";
    pub const EVM_RPC_URL: &str = "EVM_RPC_URL";
    pub const EVM_PRIVATE_KEY: &str = "EVM_PRIVATE_KEY";
    pub const ESCROW_FACTORY_ADDRESS: &str = "ESCROW_FACTORY_ADDRESS";
}

/// Parse a network selector (`mainnet`, `testnet`, `signet`, `regtest`)
pub fn parse_network(value: &str) -> SwapResult<Network> {
    match value.trim().to_lowercase().as_str() {
        "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" | "testnet3" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(SwapError::config(format!("Unknown Bitcoin network: {}", other))),
    }
}

/// Primary and fallback API base URLs for a network
pub fn api_bases(network: Network) -> (String, Option<String>) {
    let (primary, fallback) = match network {
        Network::Bitcoin => (network::MAINNET_API_BASE, Some(network::MAINNET_FALLBACK_API_BASE)),
        Network::Signet => (network::SIGNET_API_BASE, Some(network::SIGNET_FALLBACK_API_BASE)),
        Network::Regtest => (network::REGTEST_API_BASE, None),
        _ => (network::TESTNET_API_BASE, Some(network::TESTNET_FALLBACK_API_BASE)),
    };
    (primary.to_string(), fallback.map(str::to_string))
}

/// Runtime settings shared by every CLI step
#[derive(Debug, Clone)]
pub struct SwapSettings {
    pub orders_dir: PathBuf,
    pub network: Network,
    pub btc_private_key: Option<String>,
    pub fee_rate: Option<f64>,
    pub api_base: String,
    pub fallback_api_base: Option<String>,
    pub evm_rpc_url: Option<String>,
    pub evm_private_key: Option<String>,
    pub escrow_factory: Option<String>,
}

impl SwapSettings {
    /// Load settings from environment variables, reading `.env` first
    pub fn from_env() -> SwapResult<Self> {
        dotenv::dotenv().ok();

        let network = match std_env::var(env::BTC_NETWORK) {
            Ok(value) => parse_network(&value)?,
            Err(_) => Network::Testnet,
        };
        let (default_primary, default_fallback) = api_bases(network);

        let fee_rate = match std_env::var(env::BTC_FEE_RATE) {
            Ok(value) => Some(value.parse::<f64>().map_err(|_| {
                SwapError::config(format!("{} must be a number, got {}", env::BTC_FEE_RATE, value))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            orders_dir: std_env::var(env::ORDERS_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(files::DEFAULT_ORDERS_DIR)),
            network,
            btc_private_key: std_env::var(env::BTC_PRIVATE_KEY).ok(),
            fee_rate,
            api_base: std_env::var(env::BTC_API_URL).unwrap_or(default_primary),
            fallback_api_base: std_env::var(env::BTC_FALLBACK_API_URL)
                .ok()
                .or(default_fallback),
            evm_rpc_url: std_env::var(env::EVM_RPC_URL).ok(),
            evm_private_key: std_env::var(env::EVM_PRIVATE_KEY).ok(),
            escrow_factory: std_env::var(env::ESCROW_FACTORY_ADDRESS).ok(),
        })
    }

    /// The Bitcoin signing key, required by funding, claim and refund steps
    pub fn require_btc_key(&self) -> SwapResult<&str> {
        self.btc_private_key
            .as_deref()
            .ok_or_else(|| SwapError::config(format!("{} is not set", env::BTC_PRIVATE_KEY)))
    }

    /// EVM RPC URL, signer key and factory address, required by escrow steps
    pub fn require_evm(&self) -> SwapResult<(&str, &str, &str)> {
        let missing = |name: &str| SwapError::config(format!("{} is not set", name));
        Ok((
            self.evm_rpc_url.as_deref().ok_or_else(|| missing(env::EVM_RPC_URL))?,
            self.evm_private_key
                .as_deref()
                .ok_or_else(|| missing(env::EVM_PRIVATE_KEY))?,
            self.escrow_factory
                .as_deref()
                .ok_or_else(|| missing(env::ESCROW_FACTORY_ADDRESS))?,
        ))
    }
}
