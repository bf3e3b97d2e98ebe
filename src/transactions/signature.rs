//! ECDSA signing with canonical-encoding enforcement.
//!
//! Every signature placed into an HTLC spend or funding input goes through
//! [`sign_digest`], which low-S normalizes and then re-checks the encoding
//! against strict DER (BIP66) by a parse and re-serialize round, and the
//! low-S rule (BIP62/BIP146).
//! A signature that fails either check is never returned.

use crate::error::{SwapError, SwapResult};
use bitcoin::{
    ecdsa,
    secp256k1::{ecdsa::Signature, All, Message, Secp256k1, SecretKey},
    sighash::EcdsaSighashType,
};

/// Sign a sighash digest with `SIGHASH_ALL`.
///
/// Returns the DER signature with the sighash byte appended, ready for a
/// witness or scriptSig.
pub fn sign_digest(
    secp: &Secp256k1<All>,
    digest: [u8; 32],
    key: &SecretKey,
) -> SwapResult<Vec<u8>> {
    let message = Message::from_digest(digest);
    let mut signature = secp.sign_ecdsa(&message, key);
    signature.normalize_s();

    let der = signature.serialize_der();
    ensure_canonical(&der)?;

    Ok(ecdsa::Signature {
        signature,
        sighash_type: EcdsaSighashType::All,
    }
    .to_vec())
}

/// Check a DER signature (without sighash byte) for strict encoding and low S
pub fn ensure_canonical(der: &[u8]) -> SwapResult<()> {
    let parsed = Signature::from_der(der)
        .map_err(|e| SwapError::non_canonical(format!("invalid DER: {}", e)))?;
    // Must re-serialize byte for byte
    if parsed.serialize_der().as_ref() != der {
        return Err(SwapError::non_canonical("invalid DER: not the canonical encoding"));
    }

    let mut normalized = parsed;
    normalized.normalize_s();
    if normalized != parsed {
        return Err(SwapError::non_canonical("S value is above half the curve order"));
    }
    Ok(())
}
