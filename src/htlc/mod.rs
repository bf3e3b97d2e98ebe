//! # HTLC Module
//!
//! Bitcoin-side hash time-locked contract handling.
//!
//! ## Components
//!
//! - **Script**: redeem script compilation, P2WSH/P2SH derivation and address validation
//! - **Extract**: recovery of the revealed secret from a claim transaction

pub mod extract;
pub mod script;

pub use extract::{extract_secret, extract_verified_secret};
pub use script::{build, validate_address, AddressKind, HtlcConfig, HtlcOutput, ParsedAddress};
