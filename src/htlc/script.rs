//! # HTLC Script Builder
//!
//! Compiles the Bitcoin HTLC redeem script and derives its locking script and
//! address, either as native segwit (P2WSH) or legacy (P2SH).
//!
//! ## Script Structure
//! ```text
//! OP_IF
//!     OP_SHA256 <hashlock> OP_EQUALVERIFY <receiver_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! ## Spending Paths
//! - **Claim (IF = TRUE)**: receiver signature plus the secret, any time
//! - **Refund (IF = FALSE)**: sender signature once `locktime` has passed
//!
//! Derivation is a pure function of [`HtlcConfig`]: the same config always
//! produces byte-identical scripts and the same address.

use crate::error::{SwapError, SwapResult};
use crate::secret::Hashlock;
use bitcoin::{
    absolute::LockTime,
    address::AddressType,
    hashes::Hash,
    opcodes::all::*,
    script::{Builder, Instruction},
    Address, Network, PublicKey, Script, ScriptBuf,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Address family, resolved once when an address is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressKind {
    /// Base58 P2PKH / P2SH
    Legacy,
    /// Bech32 P2WPKH / P2WSH
    SegwitV0,
    /// Bech32m P2TR
    SegwitV1,
}

impl AddressKind {
    pub fn of(address: &Address) -> SwapResult<Self> {
        match address.address_type() {
            Some(AddressType::P2pkh) | Some(AddressType::P2sh) => Ok(AddressKind::Legacy),
            Some(AddressType::P2wpkh) | Some(AddressType::P2wsh) => Ok(AddressKind::SegwitV0),
            Some(AddressType::P2tr) => Ok(AddressKind::SegwitV1),
            _ => Err(SwapError::address(
                address.to_string(),
                "unsupported address type",
            )),
        }
    }
}

/// A network-checked address with its resolved kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub address: Address,
    pub kind: AddressKind,
}

/// Parse an address for `network` and resolve its [`AddressKind`]
pub fn parse_address(address: &str, network: Network) -> SwapResult<ParsedAddress> {
    let unchecked = Address::from_str(address.trim())
        .map_err(|e| SwapError::address(address, e.to_string()))?;
    let checked = unchecked
        .require_network(network)
        .map_err(|e| SwapError::address(address, e.to_string()))?;
    let kind = AddressKind::of(&checked)?;
    Ok(ParsedAddress {
        address: checked,
        kind,
    })
}

/// Parameters of one HTLC. Changing any field changes the derived address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcConfig {
    /// Funder; may refund after `locktime`
    pub sender_pubkey: PublicKey,
    /// Counterparty; may claim with the secret
    pub receiver_pubkey: PublicKey,
    pub hashlock: Hashlock,
    /// Absolute CLTV locktime (UNIX time or block height)
    pub locktime: LockTime,
    pub network: Network,
    /// P2WSH when true, P2SH otherwise
    pub segwit: bool,
}

impl HtlcConfig {
    /// Create a config, rejecting uncompressed keys and a zero locktime
    pub fn new(
        sender_pubkey: PublicKey,
        receiver_pubkey: PublicKey,
        hashlock: Hashlock,
        locktime: LockTime,
        network: Network,
        segwit: bool,
    ) -> SwapResult<Self> {
        if !sender_pubkey.compressed || !receiver_pubkey.compressed {
            return Err(SwapError::config("HTLC public keys must be 33-byte compressed points"));
        }
        if locktime.to_consensus_u32() == 0 {
            return Err(SwapError::config("HTLC locktime must be non-zero"));
        }
        Ok(Self {
            sender_pubkey,
            receiver_pubkey,
            hashlock,
            locktime,
            network,
            segwit,
        })
    }
}

/// Derived scripts and address of an HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcOutput {
    pub address: Address,
    pub redeem_script: ScriptBuf,
    /// `0 <sha256>` for P2WSH, `HASH160 <hash160> EQUAL` for P2SH
    pub locking_script: ScriptBuf,
    /// SHA-256 (P2WSH) or HASH160 (P2SH) of the redeem script
    pub script_hash: Vec<u8>,
    /// Same bytes as `redeem_script`, present only for segwit
    pub witness_script: Option<ScriptBuf>,
}

impl HtlcOutput {
    pub fn is_segwit(&self) -> bool {
        self.witness_script.is_some()
    }

    pub fn kind(&self) -> AddressKind {
        if self.is_segwit() {
            AddressKind::SegwitV0
        } else {
            AddressKind::Legacy
        }
    }
}

/// Compile the HTLC redeem script
pub fn redeem_script(config: &HtlcConfig) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(*config.hashlock.as_bytes())
        .push_opcode(OP_EQUALVERIFY)
        .push_key(&config.receiver_pubkey)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_int(config.locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(&config.sender_pubkey)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// Derive the full [`HtlcOutput`] for a config
pub fn build(config: &HtlcConfig) -> SwapResult<HtlcOutput> {
    let redeem = redeem_script(config);
    from_redeem_script(redeem, config.network, config.segwit)
}

/// Derive locking script and address from an already compiled redeem script
pub fn from_redeem_script(
    redeem: ScriptBuf,
    network: Network,
    segwit: bool,
) -> SwapResult<HtlcOutput> {
    if segwit {
        let wscript_hash = redeem.wscript_hash();
        let locking_script = ScriptBuf::new_p2wsh(&wscript_hash);
        let address = Address::p2wsh(&redeem, network);
        debug_assert_eq!(address.script_pubkey(), locking_script);

        Ok(HtlcOutput {
            address,
            locking_script,
            script_hash: wscript_hash.to_byte_array().to_vec(),
            witness_script: Some(redeem.clone()),
            redeem_script: redeem,
        })
    } else {
        let script_hash = redeem.script_hash();
        let locking_script = ScriptBuf::new_p2sh(&script_hash);
        let address = Address::p2sh(&redeem, network)
            .map_err(|e| SwapError::config(format!("Redeem script not P2SH-compatible: {}", e)))?;

        Ok(HtlcOutput {
            address,
            locking_script,
            script_hash: script_hash.to_byte_array().to_vec(),
            witness_script: None,
            redeem_script: redeem,
        })
    }
}

/// Check that `address` decodes for `network` and carries an HTLC-capable
/// script template (P2SH or P2WSH).
pub fn validate_address(address: &str, network: Network) -> bool {
    let Ok(unchecked) = Address::from_str(address.trim()) else {
        return false;
    };
    if !unchecked.is_valid_for_network(network) {
        return false;
    }
    let script_pubkey = unchecked.assume_checked().script_pubkey();
    script_pubkey.is_p2sh() || script_pubkey.is_p2wsh()
}

/// Check that `address` is exactly the HTLC derived from `config`
pub fn address_matches_config(address: &str, config: &HtlcConfig) -> SwapResult<bool> {
    let parsed = parse_address(address, config.network)?;
    let derived = build(config)?;
    Ok(parsed.address.script_pubkey() == derived.locking_script)
}

/// Terms recovered from a redeem script matching the HTLC template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcTerms {
    pub hashlock: Hashlock,
    pub receiver_pubkey: PublicKey,
    pub sender_pubkey: PublicKey,
    pub locktime: LockTime,
}

/// Decode a redeem script, failing unless it matches the template exactly
pub fn decode_redeem_script(script: &Script) -> SwapResult<HtlcTerms> {
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| not_htlc(&e.to_string()))?;
    if instructions.len() != 13 {
        return Err(not_htlc("unexpected instruction count"));
    }

    expect_op(&instructions, 0, OP_IF)?;
    expect_op(&instructions, 1, OP_SHA256)?;
    let hashlock = Hashlock::from_slice(push_at(&instructions, 2)?)?;
    expect_op(&instructions, 3, OP_EQUALVERIFY)?;
    let receiver_pubkey = PublicKey::from_slice(push_at(&instructions, 4)?)
        .map_err(|e| not_htlc(&format!("receiver key: {}", e)))?;
    expect_op(&instructions, 5, OP_CHECKSIG)?;
    expect_op(&instructions, 6, OP_ELSE)?;
    let locktime = locktime_at(&instructions, 7)?;
    expect_op(&instructions, 8, OP_CLTV)?;
    expect_op(&instructions, 9, OP_DROP)?;
    let sender_pubkey = PublicKey::from_slice(push_at(&instructions, 10)?)
        .map_err(|e| not_htlc(&format!("sender key: {}", e)))?;
    expect_op(&instructions, 11, OP_CHECKSIG)?;
    expect_op(&instructions, 12, OP_ENDIF)?;

    Ok(HtlcTerms {
        hashlock,
        receiver_pubkey,
        sender_pubkey,
        locktime: LockTime::from_consensus(locktime),
    })
}

fn not_htlc(reason: &str) -> SwapError {
    SwapError::transaction(format!("Not an HTLC script: {}", reason))
}

fn expect_op(
    instructions: &[Instruction<'_>],
    index: usize,
    opcode: bitcoin::opcodes::Opcode,
) -> SwapResult<()> {
    match &instructions[index] {
        Instruction::Op(op) if *op == opcode => Ok(()),
        _ => Err(not_htlc(&format!("expected {:?} at position {}", opcode, index))),
    }
}

fn push_at<'a>(instructions: &[Instruction<'a>], index: usize) -> SwapResult<&'a [u8]> {
    match &instructions[index] {
        Instruction::PushBytes(bytes) => {
            let bytes: &'a bitcoin::script::PushBytes = bytes;
            Ok(bytes.as_bytes())
        }
        _ => Err(not_htlc(&format!("expected push at position {}", index))),
    }
}

/// Locktimes 1 to 16 compile to `OP_PUSHNUM_n`, everything larger to a script number push
fn locktime_at(instructions: &[Instruction<'_>], index: usize) -> SwapResult<u32> {
    match &instructions[index] {
        Instruction::Op(op)
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&op.to_u8()) =>
        {
            Ok(u32::from(op.to_u8() - OP_PUSHNUM_1.to_u8() + 1))
        }
        Instruction::PushBytes(bytes) => {
            decode_script_num(bytes.as_bytes()).ok_or_else(|| not_htlc("locktime encoding"))
        }
        _ => Err(not_htlc(&format!("expected locktime at position {}", index))),
    }
}

/// Minimal little-endian script number, up to 5 bytes, non-negative
fn decode_script_num(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 5 {
        return None;
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        return None;
    }
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as u64) << (8 * i);
    }
    u32::try_from(value).ok()
}
