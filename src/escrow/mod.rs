//! # EVM Escrow Parameters
//!
//! Values passed to the escrow factory and escrow contracts: the packed
//! timelocks word and the `Immutables` tuple every escrow call carries.
//! The contract ABI itself lives in [`abi`].

pub mod abi;

use crate::error::{SwapError, SwapResult};
use crate::secret::Hashlock;
use alloy::primitives::{keccak256, Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const DEPLOYED_AT_SHIFT: usize = 224;
const CANCELLATION_SHIFT: usize = 64;
const PUBLIC_WITHDRAWAL_SHIFT: usize = 32;

/// Escrow time windows, in seconds relative to `deployed_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timelocks {
    /// Start of the taker-only withdrawal window
    pub withdrawal: u32,
    /// Start of the public withdrawal window
    pub public_withdrawal: u32,
    /// Start of the cancellation window
    pub cancellation: u32,
    /// Escrow deployment timestamp; zero until the escrow exists
    #[serde(default)]
    pub deployed_at: u32,
}

impl Timelocks {
    /// Create validated timelocks that are not yet deployed
    pub fn new(withdrawal: u32, public_withdrawal: u32, cancellation: u32) -> SwapResult<Self> {
        let timelocks = Self {
            withdrawal,
            public_withdrawal,
            cancellation,
            deployed_at: 0,
        };
        timelocks.validate()?;
        Ok(timelocks)
    }

    /// Check `withdrawal <= public_withdrawal <= cancellation` and `cancellation > 0`.
    ///
    /// A zero withdrawal period is accepted when the ordering holds.
    pub fn validate(&self) -> SwapResult<()> {
        if self.cancellation == 0 {
            return Err(SwapError::config("Cancellation period must be non-zero"));
        }
        if self.withdrawal > self.public_withdrawal {
            return Err(SwapError::config(format!(
                "Withdrawal period ({}s) must not exceed public withdrawal period ({}s)",
                self.withdrawal, self.public_withdrawal
            )));
        }
        if self.public_withdrawal > self.cancellation {
            return Err(SwapError::config(format!(
                "Public withdrawal period ({}s) must not exceed cancellation period ({}s)",
                self.public_withdrawal, self.cancellation
            )));
        }
        Ok(())
    }

    pub fn with_deployed_at(self, deployed_at: u32) -> Self {
        Self {
            deployed_at,
            ..self
        }
    }

    /// `deployedAt<<224 | cancellation<<64 | publicWithdrawal<<32 | withdrawal`
    pub fn pack(&self) -> U256 {
        (U256::from(self.deployed_at) << DEPLOYED_AT_SHIFT)
            | (U256::from(self.cancellation) << CANCELLATION_SHIFT)
            | (U256::from(self.public_withdrawal) << PUBLIC_WITHDRAWAL_SHIFT)
            | U256::from(self.withdrawal)
    }

    pub fn unpack(packed: U256) -> Self {
        let field = |shift: usize| -> u32 {
            let value = (packed >> shift) & U256::from(u32::MAX);
            value.to::<u32>()
        };
        Self {
            withdrawal: field(0),
            public_withdrawal: field(PUBLIC_WITHDRAWAL_SHIFT),
            cancellation: field(CANCELLATION_SHIFT),
            deployed_at: field(DEPLOYED_AT_SHIFT),
        }
    }

    /// Absolute time at which cancellation opens, once deployed
    pub fn cancellation_start(&self) -> Option<u64> {
        (self.deployed_at != 0).then(|| self.deployed_at as u64 + self.cancellation as u64)
    }
}

/// Escrow `orderHash` for an order identifier
pub fn order_hash(order_id: &str) -> B256 {
    keccak256(order_id.as_bytes())
}

/// Parse a `0x`-prefixed EVM address
pub fn parse_evm_address(value: &str) -> SwapResult<Address> {
    Address::from_str(value.trim())
        .map_err(|e| SwapError::config(format!("Invalid EVM address {}: {}", value, e)))
}

/// The tuple identifying one escrow instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowImmutables {
    pub order_hash: B256,
    pub hashlock: B256,
    pub maker: Address,
    pub taker: Address,
    /// `Address::ZERO` for the native token
    pub token: Address,
    pub amount: U256,
    pub safety_deposit: U256,
    pub timelocks: Timelocks,
}

impl EscrowImmutables {
    pub fn new(
        order_id: &str,
        hashlock: &Hashlock,
        maker: Address,
        taker: Address,
        token: Address,
        amount: u128,
        safety_deposit: u128,
        timelocks: Timelocks,
    ) -> Self {
        Self {
            order_hash: order_hash(order_id),
            hashlock: B256::from(*hashlock.as_bytes()),
            maker,
            taker,
            token,
            amount: U256::from(amount),
            safety_deposit: U256::from(safety_deposit),
            timelocks,
        }
    }

    pub fn is_native(&self) -> bool {
        self.token == Address::ZERO
    }

    /// Value to attach to the creation call
    pub fn required_value(&self) -> U256 {
        if self.is_native() {
            self.amount + self.safety_deposit
        } else {
            self.safety_deposit
        }
    }
}

impl From<&EscrowImmutables> for abi::Immutables {
    fn from(immutables: &EscrowImmutables) -> Self {
        abi::Immutables {
            orderHash: immutables.order_hash,
            hashlock: immutables.hashlock,
            maker: immutables.maker,
            taker: immutables.taker,
            token: immutables.token,
            amount: immutables.amount,
            safetyDeposit: immutables.safety_deposit,
            timelocks: immutables.timelocks.pack(),
        }
    }
}
