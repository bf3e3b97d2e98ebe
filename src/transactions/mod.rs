//! # Transaction Builder
//!
//! Assembles and signs the three Bitcoin transactions of a swap:
//!
//! - **Funding**: pays the HTLC address from the funder's UTXOs
//! - **Claim**: spends the HTLC through the secret path
//! - **Refund**: spends the HTLC through the timeout path
//!
//! All three share the fee model in this module. Sizes are fixed
//! conservative estimates per [`TxShape`], so the fee of a transaction is
//! reproducible from its shape and the fee rate alone.

pub mod funding;
pub mod signature;
pub mod spend;

use crate::config::fees;
use crate::error::{SwapError, SwapResult};
use crate::htlc::AddressKind;
use bitcoin::{consensus::encode::serialize_hex, OutPoint, ScriptBuf, Transaction, Txid, Wtxid};
use serde::{Deserialize, Serialize};

pub use funding::{build_funding, select_utxos, FundingRequest, FundingTransaction, UtxoSelection};
pub use spend::{build_claim, build_refund, finalize_spend, SpendRequest, SpendStack};

/// An unspent output owned by a known address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub address: String,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// A finished, signed transaction. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionArtifact {
    pub txid: Txid,
    pub raw_hex: String,
    /// Sum of inputs minus sum of outputs, in satoshis
    pub fee: u64,
    pub vsize: u64,
    /// Present when the transaction carries witness data
    pub wtxid: Option<Wtxid>,
    pub transaction: Transaction,
}

impl TransactionArtifact {
    pub fn new(transaction: Transaction, fee: u64) -> Self {
        let has_witness = transaction.input.iter().any(|input| !input.witness.is_empty());
        Self {
            txid: transaction.compute_txid(),
            raw_hex: serialize_hex(&transaction),
            fee,
            vsize: transaction.vsize() as u64,
            wtxid: has_witness.then(|| transaction.compute_wtxid()),
            transaction,
        }
    }
}

/// Transaction shapes with a fixed size estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxShape {
    /// `inputs` spends of the funder's address kind, plus `outputs` outputs
    Funding {
        input_kind: AddressKind,
        inputs: usize,
        outputs: usize,
    },
    Claim { segwit: bool },
    Refund { segwit: bool },
}

impl TxShape {
    /// Conservative virtual size in vbytes
    pub fn estimated_vsize(&self) -> u64 {
        match *self {
            TxShape::Funding {
                input_kind,
                inputs,
                outputs,
            } => {
                let per_input = match input_kind {
                    AddressKind::Legacy => fees::P2PKH_INPUT_VBYTES,
                    AddressKind::SegwitV0 | AddressKind::SegwitV1 => fees::P2WPKH_INPUT_VBYTES,
                };
                fees::TX_OVERHEAD_VBYTES
                    + per_input * inputs as u64
                    + fees::OUTPUT_VBYTES * outputs as u64
            }
            TxShape::Claim { segwit: true } => fees::SEGWIT_CLAIM_VBYTES,
            TxShape::Claim { segwit: false } => fees::LEGACY_CLAIM_VBYTES,
            TxShape::Refund { segwit: true } => fees::SEGWIT_REFUND_VBYTES,
            TxShape::Refund { segwit: false } => fees::LEGACY_REFUND_VBYTES,
        }
    }
}

/// `ceil(vsize * fee_rate)`
pub fn fee_for(vsize: u64, fee_rate: f64) -> u64 {
    (vsize as f64 * fee_rate).ceil() as u64
}

/// Reject fee rates that are not positive finite numbers
pub fn check_fee_rate(fee_rate: f64) -> SwapResult<()> {
    if !fee_rate.is_finite() || fee_rate <= 0.0 {
        return Err(SwapError::config(format!(
            "Fee rate must be a positive number of sat/vB, got {}",
            fee_rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rounds_up() {
        assert_eq!(fee_for(200, 1.0), 200);
        assert_eq!(fee_for(200, 1.001), 201);
        assert_eq!(fee_for(141, 2.5), 353);
    }

    #[test]
    fn test_funding_shape_estimate() {
        let segwit = TxShape::Funding {
            input_kind: AddressKind::SegwitV0,
            inputs: 2,
            outputs: 2,
        };
        assert_eq!(segwit.estimated_vsize(), 11 + 2 * 68 + 2 * 43);

        let legacy = TxShape::Funding {
            input_kind: AddressKind::Legacy,
            inputs: 1,
            outputs: 1,
        };
        assert_eq!(legacy.estimated_vsize(), 11 + 148 + 43);
    }

    #[test]
    fn test_legacy_spends_cost_more() {
        assert!(
            TxShape::Claim { segwit: false }.estimated_vsize()
                > TxShape::Claim { segwit: true }.estimated_vsize()
        );
        assert!(
            TxShape::Refund { segwit: false }.estimated_vsize()
                > TxShape::Refund { segwit: true }.estimated_vsize()
        );
    }

    #[test]
    fn test_fee_rate_validation() {
        assert!(check_fee_rate(1.5).is_ok());
        assert!(check_fee_rate(0.0).is_err());
        assert!(check_fee_rate(-3.0).is_err());
        assert!(check_fee_rate(f64::NAN).is_err());
    }
}
