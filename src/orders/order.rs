//! Order aggregate and its component records.

use crate::error::{SwapError, SwapResult};
use crate::escrow::{parse_evm_address, EscrowImmutables, Timelocks};
use crate::htlc::script::{AddressKind, HtlcConfig, HtlcOutput};
use crate::secret::{Hashlock, Secret};
use bitcoin::{absolute::LockTime, Network, OutPoint, PublicKey, ScriptBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Swap lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Filled,
    Funded,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Funded => "FUNDED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Which asset the maker gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwapDirection {
    /// Maker locks ETH/ERC20 in the source escrow, taker locks BTC
    EvmToBtc,
    /// Maker locks BTC, taker locks ETH/ERC20 in the destination escrow
    BtcToEvm,
}

impl SwapDirection {
    /// Whether the maker funds the Bitcoin HTLC
    pub fn maker_funds_btc(&self) -> bool {
        matches!(self, SwapDirection::BtcToEvm)
    }
}

impl fmt::Display for SwapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapDirection::EvmToBtc => f.write_str("evm-to-btc"),
            SwapDirection::BtcToEvm => f.write_str("btc-to-evm"),
        }
    }
}

impl FromStr for SwapDirection {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "evm-to-btc" | "eth-to-btc" => Ok(SwapDirection::EvmToBtc),
            "btc-to-evm" | "btc-to-eth" => Ok(SwapDirection::BtcToEvm),
            other => Err(SwapError::config(format!("Unknown swap direction: {}", other))),
        }
    }
}

/// A party's addresses on both chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyIdentity {
    /// `0x`-prefixed EVM address
    pub evm_address: String,
    /// 33-byte compressed public key, hex
    pub btc_pubkey: String,
}

impl PartyIdentity {
    /// Validate both identities and normalize their encoding
    pub fn new(evm_address: &str, btc_pubkey: &str) -> SwapResult<Self> {
        let evm = parse_evm_address(evm_address)?;
        let pubkey = PublicKey::from_str(btc_pubkey.trim())
            .map_err(|e| SwapError::config(format!("Invalid Bitcoin public key: {}", e)))?;
        if !pubkey.compressed {
            return Err(SwapError::config(
                "Bitcoin public key must be a 33-byte compressed point",
            ));
        }
        Ok(Self {
            evm_address: evm.to_checksum(None),
            btc_pubkey: pubkey.to_string(),
        })
    }

    pub fn evm(&self) -> SwapResult<alloy::primitives::Address> {
        parse_evm_address(&self.evm_address)
    }

    pub fn btc(&self) -> SwapResult<PublicKey> {
        PublicKey::from_str(&self.btc_pubkey)
            .map_err(|e| SwapError::config(format!("Invalid Bitcoin public key: {}", e)))
    }
}

/// What each side of the swap moves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    /// ERC20 address, or the zero address for the native token
    pub evm_token: String,
    /// Token amount in base units
    pub evm_amount: u128,
    /// Safety deposit in wei
    pub evm_safety_deposit: u128,
    /// Satoshis locked in the HTLC
    pub btc_sats: u64,
}

/// Timing parameters on both chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTimelocks {
    pub evm: Timelocks,
    /// Absolute CLTV locktime of the Bitcoin HTLC
    pub btc_locktime: u32,
}

impl SwapTimelocks {
    pub fn btc_locktime(&self) -> LockTime {
        LockTime::from_consensus(self.btc_locktime)
    }
}

/// The derived Bitcoin HTLC, persisted once and never changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcRecord {
    pub address: String,
    pub kind: AddressKind,
    pub redeem_script: ScriptBuf,
    pub locking_script: ScriptBuf,
    /// Hex of the SHA-256 (P2WSH) or HASH160 (P2SH) script hash
    pub script_hash: String,
    pub sender_pubkey: String,
    pub receiver_pubkey: String,
    pub locktime: u32,
}

impl HtlcRecord {
    pub fn from_output(output: &HtlcOutput, sender: &PublicKey, receiver: &PublicKey, locktime: u32) -> Self {
        Self {
            address: output.address.to_string(),
            kind: output.kind(),
            redeem_script: output.redeem_script.clone(),
            locking_script: output.locking_script.clone(),
            script_hash: hex::encode(&output.script_hash),
            sender_pubkey: sender.to_string(),
            receiver_pubkey: receiver.to_string(),
            locktime,
        }
    }

    pub fn is_segwit(&self) -> bool {
        self.kind == AddressKind::SegwitV0
    }
}

/// Which escrow factory entry point created the escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowSide {
    Src,
    Dst,
}

/// A deployed EVM escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub address: String,
    pub side: EscrowSide,
    /// Block timestamp of the creation transaction
    pub deployed_at: u32,
}

/// Reference to a confirmed or broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub txid: String,
    pub recorded_at: DateTime<Utc>,
}

impl TxRef {
    pub fn new(txid: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            txid: txid.into(),
            recorded_at,
        }
    }
}

/// The HTLC funding output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcFunding {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
    pub fee: u64,
}

impl BtcFunding {
    pub fn outpoint(&self) -> SwapResult<OutPoint> {
        let txid = self
            .txid
            .parse()
            .map_err(|e| SwapError::transaction(format!("Invalid funding txid {}: {}", self.txid, e)))?;
        Ok(OutPoint::new(txid, self.vout))
    }
}

/// Per-chain transaction references
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRefs {
    pub btc_funding: Option<BtcFunding>,
    pub btc_claim: Option<TxRef>,
    pub btc_refund: Option<TxRef>,
    pub evm_escrow: Option<TxRef>,
    pub evm_withdraw: Option<TxRef>,
    pub evm_cancel: Option<TxRef>,
}

/// One entry of the status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
    pub note: String,
}

/// The cross-chain swap aggregate, persisted as one JSON document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub direction: SwapDirection,
    pub network: Network,
    pub maker: PartyIdentity,
    pub taker: Option<PartyIdentity>,
    pub amounts: AssetAmount,
    pub hashlock: Hashlock,
    /// Known to the maker from creation; learned by the taker on reveal
    pub secret: Option<Secret>,
    pub timelocks: SwapTimelocks,
    pub status: OrderStatus,
    pub htlc: Option<HtlcRecord>,
    pub escrow: Option<EscrowRecord>,
    #[serde(default)]
    pub transactions: TransactionRefs,
    /// Outpoints consumed by broadcast funding transactions
    #[serde(default)]
    pub spent_outpoints: Vec<OutPoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
}

impl Order {
    /// The party funding the Bitcoin HTLC
    pub fn btc_sender(&self) -> Option<&PartyIdentity> {
        if self.direction.maker_funds_btc() {
            Some(&self.maker)
        } else {
            self.taker.as_ref()
        }
    }

    /// The party claiming the Bitcoin HTLC with the secret
    pub fn btc_receiver(&self) -> Option<&PartyIdentity> {
        if self.direction.maker_funds_btc() {
            self.taker.as_ref()
        } else {
            Some(&self.maker)
        }
    }

    /// Escrow factory entry point for this direction
    pub fn escrow_side(&self) -> EscrowSide {
        match self.direction {
            SwapDirection::EvmToBtc => EscrowSide::Src,
            SwapDirection::BtcToEvm => EscrowSide::Dst,
        }
    }

    /// HTLC parameters implied by this order's parties, hashlock and locktime
    pub fn htlc_config(&self, segwit: bool) -> SwapResult<HtlcConfig> {
        let sender = self
            .btc_sender()
            .ok_or_else(|| SwapError::config("HTLC sender is unknown until the order is filled"))?;
        let receiver = self
            .btc_receiver()
            .ok_or_else(|| SwapError::config("HTLC receiver is unknown until the order is filled"))?;
        HtlcConfig::new(
            sender.btc()?,
            receiver.btc()?,
            self.hashlock,
            self.timelocks.btc_locktime(),
            self.network,
            segwit,
        )
    }

    /// Escrow immutables for this order, stamped with the recorded deployment time
    pub fn escrow_immutables(&self) -> SwapResult<EscrowImmutables> {
        let taker = self
            .taker
            .as_ref()
            .ok_or_else(|| SwapError::config("escrow taker is unknown until the order is filled"))?;
        Ok(EscrowImmutables::new(
            &self.order_id,
            &self.hashlock,
            self.maker.evm()?,
            taker.evm()?,
            parse_evm_address(&self.amounts.evm_token)?,
            self.amounts.evm_amount,
            self.amounts.evm_safety_deposit,
            self.timelocks.evm,
        ))
    }

    /// Whether any claim has been recorded on either chain
    pub fn has_claim(&self) -> bool {
        self.transactions.btc_claim.is_some() || self.transactions.evm_withdraw.is_some()
    }
}
