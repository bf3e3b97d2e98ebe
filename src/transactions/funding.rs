//! HTLC funding transaction.
//!
//! UTXOs of the funder's address are selected largest-first until they
//! cover the HTLC amount plus the fee for a two-output transaction. Output 0
//! always pays the HTLC; output 1 returns change only when the change is
//! above the dust threshold, otherwise the remainder goes to the fee.
//!
//! Supported funder addresses are P2WPKH (signed over the previous output's
//! script and value) and P2PKH (signed over the script after checking the
//! full previous transaction).

use super::{check_fee_rate, fee_for, signature, TransactionArtifact, TxShape, Utxo};
use crate::config::fees::DUST_THRESHOLD_SATS;
use crate::error::{SwapError, SwapResult};
use crate::htlc::script::{AddressKind, ParsedAddress};
use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    script::{Builder, PushBytesBuf},
    secp256k1::Secp256k1,
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::{HashMap, HashSet};

/// Everything needed to fund an HTLC
#[derive(Debug, Clone)]
pub struct FundingRequest<'a> {
    pub htlc_address: &'a Address,
    /// Satoshis to lock in the HTLC
    pub amount: u64,
    pub fee_rate: f64,
    /// Source of the UTXOs and destination of the change
    pub funder: &'a ParsedAddress,
    pub utxos: &'a [Utxo],
    /// Previous transactions of legacy inputs, keyed by txid
    pub previous_txs: &'a HashMap<Txid, Transaction>,
    /// Outpoints already consumed by an earlier broadcast
    pub spent: &'a HashSet<OutPoint>,
}

/// Signed funding transaction plus bookkeeping for the order record
#[derive(Debug, Clone)]
pub struct FundingTransaction {
    pub artifact: TransactionArtifact,
    /// Output index paying the HTLC
    pub htlc_vout: u32,
    pub spent_outpoints: Vec<OutPoint>,
    pub change: Option<u64>,
}

/// Result of coin selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSelection {
    pub selected: Vec<Utxo>,
    pub total: u64,
    pub fee: u64,
    pub change: Option<u64>,
}

/// The locking script of the address a private key funds from
pub fn funder_script(key: &PrivateKey, kind: AddressKind) -> SwapResult<ScriptBuf> {
    let secp = Secp256k1::new();
    match kind {
        AddressKind::SegwitV0 => {
            let compressed = CompressedPublicKey::from_private_key(&secp, key)
                .map_err(|e| SwapError::crypto(format!("Key is not compressed: {}", e)))?;
            Ok(ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()))
        }
        AddressKind::Legacy => Ok(ScriptBuf::new_p2pkh(&key.public_key(&secp).pubkey_hash())),
        AddressKind::SegwitV1 => Err(SwapError::address(
            "taproot",
            "funding from P2TR addresses is not supported",
        )),
    }
}

/// The address a private key funds from, for the given address kind
pub fn funder_address(key: &PrivateKey, kind: AddressKind, network: Network) -> SwapResult<Address> {
    let script = funder_script(key, kind)?;
    Address::from_script(&script, network)
        .map_err(|e| SwapError::address(script.to_hex_string(), e.to_string()))
}

/// Pick UTXOs largest-first, skipping duplicates and spent outpoints.
///
/// Fails with [`SwapError::InsufficientFunds`] when even every candidate
/// cannot cover `amount` plus the fee.
pub fn select_utxos(
    utxos: &[Utxo],
    spent: &HashSet<OutPoint>,
    amount: u64,
    fee_rate: f64,
    input_kind: AddressKind,
) -> SwapResult<UtxoSelection> {
    check_fee_rate(fee_rate)?;

    let mut seen = HashSet::new();
    let mut candidates: Vec<&Utxo> = utxos
        .iter()
        .filter(|utxo| !spent.contains(&utxo.outpoint()))
        .filter(|utxo| seen.insert(utxo.outpoint()))
        .collect();
    candidates.sort_by(|a, b| b.value.cmp(&a.value));

    let fee_with = |inputs: usize, outputs: usize| {
        fee_for(
            TxShape::Funding {
                input_kind,
                inputs,
                outputs,
            }
            .estimated_vsize(),
            fee_rate,
        )
    };

    // An amount too large to add a fee to can never be covered
    let target = |fee: u64| {
        amount.checked_add(fee).ok_or_else(|| SwapError::InsufficientFunds {
            required: u64::MAX,
            available: utxos.iter().fold(0u64, |sum, utxo| sum.saturating_add(utxo.value)),
        })
    };

    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in candidates {
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.value);
        if total >= target(fee_with(selected.len(), 2))? {
            break;
        }
    }

    let n = selected.len();
    let fee_two = fee_with(n, 2);
    let with_change = target(fee_two)?;
    if total > with_change.saturating_add(DUST_THRESHOLD_SATS) {
        return Ok(UtxoSelection {
            change: Some(total - with_change),
            selected,
            total,
            fee: fee_two,
        });
    }

    let fee_one = fee_with(n.max(1), 1);
    let without_change = target(fee_one)?;
    if n > 0 && total >= without_change {
        // Dust change is absorbed into the fee
        return Ok(UtxoSelection {
            fee: total - amount,
            selected,
            total,
            change: None,
        });
    }

    Err(SwapError::InsufficientFunds {
        required: without_change,
        available: total,
    })
}

/// Build and sign the funding transaction
pub fn build_funding(request: &FundingRequest<'_>, key: &PrivateKey) -> SwapResult<FundingTransaction> {
    if request.amount <= DUST_THRESHOLD_SATS {
        return Err(SwapError::config(format!(
            "HTLC amount {} sats must exceed the dust threshold of {} sats",
            request.amount, DUST_THRESHOLD_SATS
        )));
    }

    let source_script = funder_script(key, request.funder.kind)?;
    if source_script != request.funder.address.script_pubkey() {
        return Err(SwapError::address(
            request.funder.address.to_string(),
            "signing key does not control this address",
        ));
    }

    let selection = select_utxos(
        request.utxos,
        request.spent,
        request.amount,
        request.fee_rate,
        request.funder.kind,
    )?;

    for utxo in &selection.selected {
        if utxo.script_pubkey != source_script {
            return Err(SwapError::transaction(format!(
                "UTXO {} does not belong to funder {}",
                utxo.outpoint(),
                request.funder.address
            )));
        }
        if request.funder.kind == AddressKind::Legacy {
            check_previous_tx(utxo, request.previous_txs)?;
        }
    }

    let mut output = vec![TxOut {
        value: Amount::from_sat(request.amount),
        script_pubkey: request.htlc_address.script_pubkey(),
    }];
    if let Some(change) = selection.change {
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: source_script.clone(),
        });
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: selection
            .selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output,
    };

    let secp = Secp256k1::new();
    let digests = {
        let mut cache = SighashCache::new(&tx);
        let mut digests = Vec::with_capacity(selection.selected.len());
        for (index, utxo) in selection.selected.iter().enumerate() {
            let digest = match request.funder.kind {
                AddressKind::SegwitV0 => cache
                    .p2wpkh_signature_hash(
                        index,
                        &utxo.script_pubkey,
                        Amount::from_sat(utxo.value),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| SwapError::crypto(format!("Sighash computation failed: {}", e)))?
                    .to_byte_array(),
                _ => cache
                    .legacy_signature_hash(index, &utxo.script_pubkey, EcdsaSighashType::All.to_u32())
                    .map_err(|e| SwapError::crypto(format!("Sighash computation failed: {}", e)))?
                    .to_byte_array(),
            };
            digests.push(digest);
        }
        digests
    };

    let pubkey = key.public_key(&secp);
    for (input, digest) in tx.input.iter_mut().zip(digests) {
        let sig = signature::sign_digest(&secp, digest, &key.inner)?;
        match request.funder.kind {
            AddressKind::SegwitV0 => {
                input.witness = Witness::from_slice(&[sig, pubkey.to_bytes()]);
            }
            _ => {
                let sig = PushBytesBuf::try_from(sig)
                    .map_err(|_| SwapError::transaction("signature is too large to push"))?;
                input.script_sig = Builder::new().push_slice(sig).push_key(&pubkey).into_script();
            }
        }
    }

    let artifact = TransactionArtifact::new(tx, selection.fee);
    debug_assert_eq!(
        selection.total,
        artifact
            .transaction
            .output
            .iter()
            .map(|o| o.value.to_sat())
            .sum::<u64>()
            + artifact.fee
    );

    log::info!(
        "Built funding transaction {} locking {} sats in {} ({} inputs, fee {} sats)",
        artifact.txid,
        request.amount,
        request.htlc_address,
        selection.selected.len(),
        artifact.fee
    );
    log::debug!("Raw transaction: {}", artifact.raw_hex);

    Ok(FundingTransaction {
        spent_outpoints: selection.selected.iter().map(Utxo::outpoint).collect(),
        change: selection.change,
        htlc_vout: 0,
        artifact,
    })
}

fn check_previous_tx(utxo: &Utxo, previous_txs: &HashMap<Txid, Transaction>) -> SwapResult<()> {
    let previous = previous_txs.get(&utxo.txid).ok_or_else(|| {
        SwapError::transaction(format!(
            "Legacy input {} requires its previous transaction",
            utxo.outpoint()
        ))
    })?;
    if previous.compute_txid() != utxo.txid {
        return Err(SwapError::transaction(format!(
            "Previous transaction does not hash to {}",
            utxo.txid
        )));
    }
    let spent_output = previous.output.get(utxo.vout as usize).ok_or_else(|| {
        SwapError::transaction(format!("Previous transaction has no output {}", utxo.vout))
    })?;
    if spent_output.value.to_sat() != utxo.value || spent_output.script_pubkey != utxo.script_pubkey {
        return Err(SwapError::transaction(format!(
            "UTXO {} does not match its previous transaction",
            utxo.outpoint()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::script::{build, HtlcConfig};
    use crate::secret::{hash, Secret};

    fn key() -> PrivateKey {
        PrivateKey::from_slice(&[11; 32], Network::Testnet).unwrap()
    }

    fn htlc_address() -> Address {
        let secp = Secp256k1::new();
        let config = HtlcConfig::new(
            PrivateKey::from_slice(&[1; 32], Network::Testnet)
                .unwrap()
                .public_key(&secp),
            PrivateKey::from_slice(&[2; 32], Network::Testnet)
                .unwrap()
                .public_key(&secp),
            hash(&Secret::from_bytes([1; 32])),
            LockTime::from_consensus(2_000_000_000),
            Network::Testnet,
            true,
        )
        .unwrap();
        build(&config).unwrap().address
    }

    fn funder(kind: AddressKind) -> ParsedAddress {
        ParsedAddress {
            address: funder_address(&key(), kind, Network::Testnet).unwrap(),
            kind,
        }
    }

    fn utxo(funder: &ParsedAddress, seed: u8, value: u64) -> Utxo {
        Utxo {
            txid: Txid::from_byte_array([seed; 32]),
            vout: 0,
            value,
            script_pubkey: funder.address.script_pubkey(),
            address: funder.address.to_string(),
        }
    }

    fn input_sum(utxos: &[Utxo], tx: &Transaction) -> u64 {
        tx.input
            .iter()
            .map(|input| {
                utxos
                    .iter()
                    .find(|u| u.outpoint() == input.previous_output)
                    .unwrap()
                    .value
            })
            .sum()
    }

    #[test]
    fn test_fee_invariant_with_change() {
        let funder = funder(AddressKind::SegwitV0);
        let utxos = vec![utxo(&funder, 1, 30_000), utxo(&funder, 2, 80_000)];
        let htlc = htlc_address();
        let request = FundingRequest {
            htlc_address: &htlc,
            amount: 50_000,
            fee_rate: 3.0,
            funder: &funder,
            utxos: &utxos,
            previous_txs: &HashMap::new(),
            spent: &HashSet::new(),
        };

        let funding = build_funding(&request, &key()).unwrap();
        let tx = &funding.artifact.transaction;
        let outputs: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();

        assert_eq!(tx.input.len(), 1, "largest UTXO alone covers the amount");
        assert_eq!(input_sum(&utxos, tx), outputs + funding.artifact.fee);
        let estimate = TxShape::Funding {
            input_kind: AddressKind::SegwitV0,
            inputs: 1,
            outputs: 2,
        }
        .estimated_vsize();
        assert_eq!(funding.artifact.fee, fee_for(estimate, 3.0));
        assert_eq!(tx.output[0].script_pubkey, htlc.script_pubkey());
        assert_eq!(tx.output[0].value.to_sat(), 50_000);
        assert_eq!(funding.change, Some(80_000 - 50_000 - funding.artifact.fee));
        assert_eq!(funding.spent_outpoints, vec![utxos[1].outpoint()]);
        assert_eq!(tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_dust_change_is_absorbed() {
        let funder = funder(AddressKind::SegwitV0);
        // 1 input, 1 output at 1 sat/vB is 122 sats; leave 200 sats over
        let utxos = vec![utxo(&funder, 1, 10_000 + 122 + 200)];
        let htlc = htlc_address();
        let request = FundingRequest {
            htlc_address: &htlc,
            amount: 10_000,
            fee_rate: 1.0,
            funder: &funder,
            utxos: &utxos,
            previous_txs: &HashMap::new(),
            spent: &HashSet::new(),
        };

        let funding = build_funding(&request, &key()).unwrap();
        let tx = &funding.artifact.transaction;
        assert_eq!(tx.output.len(), 1);
        assert!(funding.change.is_none());
        assert_eq!(funding.artifact.fee, 322);
        assert_eq!(input_sum(&utxos, tx), tx.output[0].value.to_sat() + funding.artifact.fee);
    }

    #[test]
    fn test_selection_skips_spent_and_duplicates() {
        let funder = funder(AddressKind::SegwitV0);
        let big = utxo(&funder, 1, 100_000);
        let small = utxo(&funder, 2, 40_000);
        let utxos = vec![big.clone(), small.clone(), small.clone()];
        let spent: HashSet<OutPoint> = [big.outpoint()].into_iter().collect();

        let selection = select_utxos(&utxos, &spent, 20_000, 1.0, AddressKind::SegwitV0).unwrap();
        assert_eq!(selection.selected, vec![small.clone()]);

        let err = select_utxos(&utxos, &spent, 60_000, 1.0, AddressKind::SegwitV0).unwrap_err();
        match err {
            SwapError::InsufficientFunds { available, .. } => assert_eq!(available, 40_000),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_selection_accumulates_inputs() {
        let funder = funder(AddressKind::SegwitV0);
        let utxos: Vec<Utxo> = (1..=5).map(|i| utxo(&funder, i, 10_000)).collect();

        let selection = select_utxos(&utxos, &HashSet::new(), 35_000, 2.0, AddressKind::SegwitV0).unwrap();
        assert_eq!(selection.selected.len(), 4);
        assert_eq!(selection.total, 40_000);
        assert_eq!(selection.total, 35_000 + selection.fee + selection.change.unwrap_or(0));
    }

    #[test]
    fn test_oversized_amount_is_insufficient() {
        let funder = funder(AddressKind::SegwitV0);
        let utxos = vec![utxo(&funder, 1, 50_000)];
        let err = select_utxos(&utxos, &HashSet::new(), u64::MAX - 10, 5.0, AddressKind::SegwitV0)
            .unwrap_err();
        match err {
            SwapError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, u64::MAX);
                assert_eq!(available, 50_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_wallet_is_insufficient() {
        let err = select_utxos(&[], &HashSet::new(), 10_000, 1.0, AddressKind::SegwitV0).unwrap_err();
        assert!(matches!(err, SwapError::InsufficientFunds { available: 0, .. }));
    }

    #[test]
    fn test_legacy_funding_requires_previous_tx() {
        let funder = funder(AddressKind::Legacy);
        let previous = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(90_000),
                script_pubkey: funder.address.script_pubkey(),
            }],
        };
        let utxos = vec![Utxo {
            txid: previous.compute_txid(),
            vout: 0,
            value: 90_000,
            script_pubkey: funder.address.script_pubkey(),
            address: funder.address.to_string(),
        }];
        let htlc = htlc_address();
        let mut request = FundingRequest {
            htlc_address: &htlc,
            amount: 50_000,
            fee_rate: 1.0,
            funder: &funder,
            utxos: &utxos,
            previous_txs: &HashMap::new(),
            spent: &HashSet::new(),
        };
        assert!(matches!(
            build_funding(&request, &key()).unwrap_err(),
            SwapError::Transaction { .. }
        ));

        let previous_txs: HashMap<Txid, Transaction> =
            [(previous.compute_txid(), previous.clone())].into_iter().collect();
        request.previous_txs = &previous_txs;
        let funding = build_funding(&request, &key()).unwrap();
        let input = &funding.artifact.transaction.input[0];
        assert!(input.witness.is_empty());
        assert!(!input.script_sig.is_empty());
        assert!(funding.artifact.wtxid.is_none());
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let funder = funder(AddressKind::SegwitV0);
        let utxos = vec![utxo(&funder, 1, 100_000)];
        let htlc = htlc_address();
        let request = FundingRequest {
            htlc_address: &htlc,
            amount: 50_000,
            fee_rate: 1.0,
            funder: &funder,
            utxos: &utxos,
            previous_txs: &HashMap::new(),
            spent: &HashSet::new(),
        };
        let other = PrivateKey::from_slice(&[12; 32], Network::Testnet).unwrap();
        assert!(matches!(
            build_funding(&request, &other).unwrap_err(),
            SwapError::AddressFormat { .. }
        ));
    }
}
