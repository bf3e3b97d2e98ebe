//! # Secret Extraction
//!
//! Recovers the secret revealed by an HTLC claim. A claim spends input 0 with
//! the stack `[signature, secret, TRUE, redeem_script]`, carried either in the
//! witness (P2WSH) or in the scriptSig (P2SH). The second stack element is the
//! secret.
//!
//! Parsing only; fetching the transaction is the caller's job.

use crate::error::{SwapError, SwapResult};
use crate::secret::{self, Hashlock, Secret, SECRET_SIZE};
use bitcoin::{opcodes::all::*, script::Instruction, Script, Transaction, TxIn};

/// Flatten an input's unlocking data into stack elements.
///
/// Witness items are taken as-is. A scriptSig is decompiled; small-integer
/// opcodes become their minimal stack encoding.
pub fn input_stack(input: &TxIn) -> SwapResult<Vec<Vec<u8>>> {
    if !input.witness.is_empty() {
        return Ok(input.witness.iter().map(|item| item.to_vec()).collect());
    }

    let mut stack = Vec::new();
    for instruction in input.script_sig.instructions() {
        let instruction = instruction
            .map_err(|e| SwapError::secret_not_found(format!("undecodable scriptSig: {}", e)))?;
        match instruction {
            Instruction::PushBytes(bytes) => stack.push(bytes.as_bytes().to_vec()),
            Instruction::Op(op) if op == OP_PUSHNUM_1 => stack.push(vec![0x01]),
            Instruction::Op(op) => {
                return Err(SwapError::secret_not_found(format!(
                    "unexpected opcode {:?} in scriptSig",
                    op
                )))
            }
        }
    }
    Ok(stack)
}

/// Return the secret revealed by input 0 of `tx`.
///
/// Fails with [`SwapError::SecretNotFound`] when the stack has fewer than two
/// elements, when the input does not spend `redeem_script`, or when the
/// second element is not a 32-byte value (a refund spend).
pub fn extract_secret(tx: &Transaction, redeem_script: &Script) -> SwapResult<Secret> {
    let input = tx
        .input
        .first()
        .ok_or_else(|| SwapError::secret_not_found("transaction has no inputs"))?;
    let stack = input_stack(input)?;

    if stack.len() < 2 {
        return Err(SwapError::secret_not_found(format!(
            "stack has {} element(s), need at least 2",
            stack.len()
        )));
    }
    if stack.last().map(Vec::as_slice) != Some(redeem_script.as_bytes()) {
        return Err(SwapError::secret_not_found(
            "input 0 does not spend the given HTLC script",
        ));
    }

    let candidate = &stack[1];
    if candidate.len() != SECRET_SIZE {
        return Err(SwapError::secret_not_found(format!(
            "second stack element is {} bytes; not a claim spend",
            candidate.len()
        )));
    }
    Secret::from_slice(candidate)
}

/// Extract and check the secret against the expected hashlock
pub fn extract_verified_secret(
    tx: &Transaction,
    redeem_script: &Script,
    hashlock: &Hashlock,
) -> SwapResult<Secret> {
    let revealed = extract_secret(tx, redeem_script)?;
    secret::verify(&revealed, hashlock)?;
    log::info!("Recovered secret matching hashlock {}", hashlock);
    Ok(revealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime, script::Builder, transaction::Version, Amount, OutPoint, ScriptBuf,
        Sequence, TxOut, Witness,
    };

    fn spend_tx(input: TxIn) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![input],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn input_with(witness: Witness, script_sig: ScriptBuf) -> TxIn {
        TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness,
        }
    }

    fn fake_redeem_script() -> ScriptBuf {
        Builder::new().push_opcode(OP_IF).push_opcode(OP_ENDIF).into_script()
    }

    #[test]
    fn test_extracts_from_witness() {
        let redeem = fake_redeem_script();
        let secret = Secret::from_bytes([9; 32]);
        let witness = Witness::from_slice(&[
            vec![0x30; 71],
            secret.as_bytes().to_vec(),
            vec![0x01],
            redeem.to_bytes(),
        ]);
        let tx = spend_tx(input_with(witness, ScriptBuf::new()));

        assert_eq!(extract_secret(&tx, &redeem).unwrap(), secret);
        assert!(extract_verified_secret(&tx, &redeem, &secret::hash(&secret)).is_ok());
    }

    #[test]
    fn test_extracts_from_script_sig() {
        let redeem = fake_redeem_script();
        let secret = Secret::from_bytes([4; 32]);
        let script_sig = Builder::new()
            .push_slice(<&bitcoin::script::PushBytes>::try_from(&[0x30u8; 71][..]).unwrap())
            .push_slice(*secret.as_bytes())
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(<&bitcoin::script::PushBytes>::try_from(redeem.as_bytes()).unwrap())
            .into_script();
        let tx = spend_tx(input_with(Witness::new(), script_sig));

        assert_eq!(extract_secret(&tx, &redeem).unwrap(), secret);
    }

    #[test]
    fn test_short_stack_is_secret_not_found() {
        let redeem = fake_redeem_script();
        let tx = spend_tx(input_with(Witness::from_slice(&[redeem.to_bytes()]), ScriptBuf::new()));

        let err = extract_secret(&tx, &redeem).unwrap_err();
        assert!(matches!(err, SwapError::SecretNotFound { .. }));
    }

    #[test]
    fn test_refund_spend_has_no_secret() {
        let redeem = fake_redeem_script();
        let witness = Witness::from_slice(&[vec![0x30; 71], vec![], redeem.to_bytes()]);
        let tx = spend_tx(input_with(witness, ScriptBuf::new()));

        let err = extract_secret(&tx, &redeem).unwrap_err();
        assert!(matches!(err, SwapError::SecretNotFound { .. }));
    }

    #[test]
    fn test_other_script_is_rejected() {
        let redeem = fake_redeem_script();
        let witness = Witness::from_slice(&[
            vec![0x30; 71],
            vec![1; 32],
            vec![0x01],
            vec![0xac],
        ]);
        let tx = spend_tx(input_with(witness, ScriptBuf::new()));

        assert!(matches!(
            extract_secret(&tx, &redeem).unwrap_err(),
            SwapError::SecretNotFound { .. }
        ));
    }

    #[test]
    fn test_wrong_secret_fails_verification() {
        let redeem = fake_redeem_script();
        let witness = Witness::from_slice(&[
            vec![0x30; 71],
            vec![1; 32],
            vec![0x01],
            redeem.to_bytes(),
        ]);
        let tx = spend_tx(input_with(witness, ScriptBuf::new()));
        let unrelated = secret::hash(&Secret::from_bytes([2; 32]));

        assert!(matches!(
            extract_verified_secret(&tx, &redeem, &unrelated).unwrap_err(),
            SwapError::SecretMismatch { .. }
        ));
    }
}
