//! HTLC spend transactions: claim (secret path) and refund (timeout path).
//!
//! Both spend a single HTLC output to a single destination. The unlocking
//! data is produced by [`finalize_spend`], a pure function of the secret,
//! the redeem script and the signature:
//!
//! ```text
//! claim:  [signature, secret, 0x01, redeem_script]
//! refund: [signature, <empty>, redeem_script]
//! ```
//!
//! For P2WSH the stack becomes the witness; for P2SH it is pushed into the
//! scriptSig, with the branch selector encoded as `OP_1` / `OP_0`.

use super::{check_fee_rate, fee_for, signature, TransactionArtifact, TxShape, Utxo};
use crate::config::fees::DUST_THRESHOLD_SATS;
use crate::error::{SwapError, SwapResult};
use crate::htlc::script::{decode_redeem_script, HtlcOutput, ParsedAddress};
use crate::secret::{self, Secret};
use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    opcodes::all::{OP_PUSHBYTES_0, OP_PUSHNUM_1},
    script::{Builder, PushBytesBuf},
    secp256k1::Secp256k1,
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Amount, PrivateKey, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// Unlocking stack for an HTLC input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendStack {
    pub signature: Vec<u8>,
    /// `Some` selects the claim branch
    pub secret: Option<Secret>,
    pub redeem_script: ScriptBuf,
}

/// Assemble the unlocking stack for a claim (`Some(secret)`) or refund (`None`)
pub fn finalize_spend(
    secret: Option<&Secret>,
    redeem_script: &Script,
    signature: Vec<u8>,
) -> SpendStack {
    SpendStack {
        signature,
        secret: secret.copied(),
        redeem_script: redeem_script.to_owned(),
    }
}

impl SpendStack {
    pub fn is_claim(&self) -> bool {
        self.secret.is_some()
    }

    /// Stack elements, bottom first
    pub fn elements(&self) -> Vec<Vec<u8>> {
        let mut elements = vec![self.signature.clone()];
        match &self.secret {
            Some(secret) => {
                elements.push(secret.as_bytes().to_vec());
                elements.push(vec![0x01]);
            }
            None => elements.push(Vec::new()),
        }
        elements.push(self.redeem_script.to_bytes());
        elements
    }

    pub fn to_witness(&self) -> Witness {
        Witness::from_slice(&self.elements())
    }

    pub fn to_script_sig(&self) -> SwapResult<ScriptBuf> {
        let push = |bytes: Vec<u8>, what: &str| {
            PushBytesBuf::try_from(bytes)
                .map_err(|_| SwapError::transaction(format!("{} is too large to push", what)))
        };

        let mut builder = Builder::new().push_slice(push(self.signature.clone(), "signature")?);
        builder = match &self.secret {
            Some(secret) => builder
                .push_slice(*secret.as_bytes())
                .push_opcode(OP_PUSHNUM_1),
            None => builder.push_opcode(OP_PUSHBYTES_0),
        };
        Ok(builder
            .push_slice(push(self.redeem_script.to_bytes(), "redeem script")?)
            .into_script())
    }
}

/// Inputs shared by claim and refund
#[derive(Debug, Clone)]
pub struct SpendRequest<'a> {
    pub htlc: &'a HtlcOutput,
    /// The HTLC output being spent
    pub utxo: &'a Utxo,
    pub destination: &'a ParsedAddress,
    pub fee_rate: f64,
}

/// Build and sign the claim transaction.
///
/// The secret is verified against the hashlock inside the redeem script
/// before anything else happens. `key` must belong to the HTLC receiver.
pub fn build_claim(
    request: &SpendRequest<'_>,
    secret: &Secret,
    key: &PrivateKey,
) -> SwapResult<TransactionArtifact> {
    let terms = decode_redeem_script(&request.htlc.redeem_script)?;
    secret::verify(secret, &terms.hashlock)?;

    build_spend(
        request,
        Some(secret),
        &terms.receiver_pubkey,
        key,
        LockTime::ZERO,
        Sequence::ENABLE_RBF_NO_LOCKTIME,
    )
}

/// Build and sign the refund transaction.
///
/// The transaction locktime is the HTLC's CLTV locktime and the input
/// sequence is `0xfffffffe`, so the transaction is only valid once the
/// locktime has passed. Readiness is not checked here; a premature refund is
/// rejected by the network. `key` must belong to the HTLC sender.
pub fn build_refund(request: &SpendRequest<'_>, key: &PrivateKey) -> SwapResult<TransactionArtifact> {
    let terms = decode_redeem_script(&request.htlc.redeem_script)?;

    build_spend(
        request,
        None,
        &terms.sender_pubkey,
        key,
        terms.locktime,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
    )
}

fn build_spend(
    request: &SpendRequest<'_>,
    secret: Option<&Secret>,
    expected_signer: &PublicKey,
    key: &PrivateKey,
    lock_time: LockTime,
    sequence: Sequence,
) -> SwapResult<TransactionArtifact> {
    check_fee_rate(request.fee_rate)?;
    let segwit = request.htlc.is_segwit();
    let shape = if secret.is_some() {
        TxShape::Claim { segwit }
    } else {
        TxShape::Refund { segwit }
    };

    if request.utxo.script_pubkey != request.htlc.locking_script {
        return Err(SwapError::transaction(format!(
            "UTXO {} is not locked to HTLC {}",
            request.utxo.outpoint(),
            request.htlc.address
        )));
    }

    // Amount checks happen before any signing
    let fee = fee_for(shape.estimated_vsize(), request.fee_rate);
    let output_value = request
        .utxo
        .value
        .checked_sub(fee)
        .filter(|value| *value > DUST_THRESHOLD_SATS)
        .ok_or(SwapError::InsufficientFunds {
            required: fee + DUST_THRESHOLD_SATS + 1,
            available: request.utxo.value,
        })?;

    let secp = Secp256k1::new();
    if key.public_key(&secp) != *expected_signer {
        return Err(SwapError::crypto(format!(
            "Signing key {} does not match HTLC key {}",
            key.public_key(&secp),
            expected_signer
        )));
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: request.utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(output_value),
            script_pubkey: request.destination.address.script_pubkey(),
        }],
    };

    let redeem = &request.htlc.redeem_script;
    let digest = {
        let mut cache = SighashCache::new(&tx);
        if segwit {
            cache
                .p2wsh_signature_hash(
                    0,
                    redeem,
                    Amount::from_sat(request.utxo.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| SwapError::crypto(format!("Sighash computation failed: {}", e)))?
                .to_byte_array()
        } else {
            cache
                .legacy_signature_hash(0, redeem, EcdsaSighashType::All.to_u32())
                .map_err(|e| SwapError::crypto(format!("Sighash computation failed: {}", e)))?
                .to_byte_array()
        }
    };
    let sig = signature::sign_digest(&secp, digest, &key.inner)?;

    let stack = finalize_spend(secret, redeem, sig);
    if segwit {
        tx.input[0].witness = stack.to_witness();
    } else {
        tx.input[0].script_sig = stack.to_script_sig()?;
    }

    let artifact = TransactionArtifact::new(tx, fee);
    log::info!(
        "Built HTLC {} transaction {} ({} vB, fee {} sats)",
        if stack.is_claim() { "claim" } else { "refund" },
        artifact.txid,
        artifact.vsize,
        artifact.fee
    );
    log::debug!("Raw transaction: {}", artifact.raw_hex);
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fees::{
        LEGACY_CLAIM_VBYTES, LEGACY_REFUND_VBYTES, SEGWIT_CLAIM_VBYTES, SEGWIT_REFUND_VBYTES,
    };
    use crate::htlc::extract::extract_secret;
    use crate::htlc::script::{build, parse_address, HtlcConfig};
    use crate::secret::hash;
    use bitcoin::{secp256k1::Message, Network, Txid};
    use std::str::FromStr;

    fn key(seed: u8) -> PrivateKey {
        PrivateKey::from_slice(&[seed; 32], Network::Testnet).unwrap()
    }

    fn secret_one() -> Secret {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        Secret::from_bytes(bytes)
    }

    fn htlc(segwit: bool, locktime: u32) -> HtlcOutput {
        let secp = Secp256k1::new();
        let config = HtlcConfig::new(
            key(1).public_key(&secp),
            key(2).public_key(&secp),
            hash(&secret_one()),
            LockTime::from_consensus(locktime),
            Network::Testnet,
            segwit,
        )
        .unwrap();
        build(&config).unwrap()
    }

    fn htlc_utxo(output: &HtlcOutput, value: u64) -> Utxo {
        Utxo {
            txid: Txid::from_str(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            )
            .unwrap(),
            vout: 0,
            value,
            script_pubkey: output.locking_script.clone(),
            address: output.address.to_string(),
        }
    }

    fn destination() -> ParsedAddress {
        parse_address("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx", Network::Testnet).unwrap()
    }

    fn now_plus_hour() -> u32 {
        (chrono::Utc::now().timestamp() + 3_600) as u32
    }

    #[test]
    fn test_claim_reveals_secret() {
        let output = htlc(true, now_plus_hour());
        assert!(output.address.to_string().starts_with("tb1q"));
        let utxo = htlc_utxo(&output, 50_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 2.0,
        };

        let artifact = build_claim(&request, &secret_one(), &key(2)).unwrap();
        let tx = &artifact.transaction;

        let witness: Vec<Vec<u8>> = tx.input[0].witness.iter().map(|w| w.to_vec()).collect();
        assert_eq!(witness.len(), 4);
        assert_eq!(witness[1], secret_one().as_bytes().to_vec());
        assert_eq!(witness[2], vec![0x01]);
        assert_eq!(witness[3], output.redeem_script.to_bytes());
        assert_eq!(extract_secret(tx, &output.redeem_script).unwrap(), secret_one());

        assert_eq!(artifact.fee, 400);
        assert_eq!(tx.output[0].value.to_sat(), 50_000 - 400);
        assert!(artifact.wtxid.is_some());
        assert!(artifact.vsize <= SEGWIT_CLAIM_VBYTES);
    }

    #[test]
    fn test_claim_signature_verifies() {
        let output = htlc(true, now_plus_hour());
        let utxo = htlc_utxo(&output, 80_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 1.0,
        };
        let artifact = build_claim(&request, &secret_one(), &key(2)).unwrap();
        let tx = artifact.transaction.clone();

        let sighash = SighashCache::new(&tx)
            .p2wsh_signature_hash(
                0,
                &output.redeem_script,
                Amount::from_sat(80_000),
                EcdsaSighashType::All,
            )
            .unwrap();
        let der = tx.input[0].witness.nth(0).unwrap();
        let sig = bitcoin::ecdsa::Signature::from_slice(der).unwrap();

        let secp = Secp256k1::new();
        assert!(secp
            .verify_ecdsa(
                &Message::from_digest(sighash.to_byte_array()),
                &sig.signature,
                &key(2).public_key(&secp).inner
            )
            .is_ok());
    }

    #[test]
    fn test_legacy_claim_uses_script_sig() {
        let output = htlc(false, now_plus_hour());
        let utxo = htlc_utxo(&output, 50_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 1.0,
        };

        let artifact = build_claim(&request, &secret_one(), &key(2)).unwrap();
        let tx = &artifact.transaction;
        assert!(tx.input[0].witness.is_empty());
        assert!(artifact.wtxid.is_none());
        assert_eq!(extract_secret(tx, &output.redeem_script).unwrap(), secret_one());
        assert!(artifact.vsize <= LEGACY_CLAIM_VBYTES);
    }

    #[test]
    fn test_refund_sets_locktime_and_sequence() {
        let locktime = now_plus_hour();
        let output = htlc(true, locktime);
        let utxo = htlc_utxo(&output, 50_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 1.0,
        };

        let artifact = build_refund(&request, &key(1)).unwrap();
        let tx = &artifact.transaction;

        assert_eq!(tx.lock_time, LockTime::from_consensus(locktime));
        assert!(tx.input[0].sequence.to_consensus_u32() < 0xffff_ffff);
        assert!(tx.input[0].sequence.enables_absolute_lock_time());

        let witness: Vec<Vec<u8>> = tx.input[0].witness.iter().map(|w| w.to_vec()).collect();
        assert_eq!(witness.len(), 3);
        assert!(witness[1].is_empty());
        assert!(extract_secret(tx, &output.redeem_script).is_err());
        assert!(artifact.vsize <= SEGWIT_REFUND_VBYTES);
    }

    #[test]
    fn test_legacy_refund_selector_is_op_0() {
        let output = htlc(false, 800_000);
        let utxo = htlc_utxo(&output, 50_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 1.0,
        };

        let artifact = build_refund(&request, &key(1)).unwrap();
        assert!(artifact.vsize <= LEGACY_REFUND_VBYTES);
        let tx = artifact.transaction;
        assert_eq!(tx.lock_time, LockTime::from_consensus(800_000));
        let stack = crate::htlc::extract::input_stack(&tx.input[0]).unwrap();
        assert_eq!(stack.len(), 3);
        assert!(stack[1].is_empty());
    }

    #[test]
    fn test_small_height_locktimes_are_spendable() {
        for locktime in [1u32, 10, 16, 17, 128] {
            let output = htlc(true, locktime);
            let utxo = htlc_utxo(&output, 50_000);
            let dest = destination();
            let request = SpendRequest {
                htlc: &output,
                utxo: &utxo,
                destination: &dest,
                fee_rate: 1.0,
            };

            let refund = build_refund(&request, &key(1)).unwrap();
            assert_eq!(refund.transaction.lock_time, LockTime::from_consensus(locktime));

            let claim = build_claim(&request, &secret_one(), &key(2)).unwrap();
            assert_eq!(
                extract_secret(&claim.transaction, &output.redeem_script).unwrap(),
                secret_one()
            );
        }
    }

    #[test]
    fn test_claim_without_value_left_fails_before_signing() {
        let output = htlc(true, now_plus_hour());
        let utxo = htlc_utxo(&output, 400);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 2.0,
        };

        // The sender key would fail the signer check, so reaching it would
        // surface a different error.
        let err = build_claim(&request, &secret_one(), &key(1)).unwrap_err();
        match err {
            SwapError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(available, 400);
                assert!(required > 400);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_secret_is_fatal() {
        let output = htlc(true, now_plus_hour());
        let utxo = htlc_utxo(&output, 50_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 1.0,
        };

        let err = build_claim(&request, &Secret::from_bytes([8; 32]), &key(2)).unwrap_err();
        assert!(matches!(err, SwapError::SecretMismatch { .. }));
    }

    #[test]
    fn test_wrong_signer_is_rejected() {
        let output = htlc(true, now_plus_hour());
        let utxo = htlc_utxo(&output, 50_000);
        let dest = destination();
        let request = SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &dest,
            fee_rate: 1.0,
        };

        assert!(matches!(
            build_refund(&request, &key(2)).unwrap_err(),
            SwapError::Cryptography { .. }
        ));
    }

    #[test]
    fn test_spend_stack_layouts() {
        let script = ScriptBuf::from_bytes(vec![0x63, 0x68]);
        let claim = finalize_spend(Some(&secret_one()), &script, vec![0x30, 0x01]);
        assert_eq!(
            claim.elements(),
            vec![
                vec![0x30, 0x01],
                secret_one().as_bytes().to_vec(),
                vec![0x01],
                vec![0x63, 0x68]
            ]
        );

        let refund = finalize_spend(None, &script, vec![0x30, 0x01]);
        assert_eq!(
            refund.elements(),
            vec![vec![0x30, 0x01], vec![], vec![0x63, 0x68]]
        );
        assert!(!refund.is_claim());
    }
}
