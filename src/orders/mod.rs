//! # Orders
//!
//! The order record is the single source of truth for one swap attempt.
//! Each CLI step loads it, applies one transition and saves it back.
//!
//! - [`order`]: the aggregate and its records
//! - [`state_machine`]: guarded, replay-safe transitions
//! - [`store`]: atomic JSON persistence

pub mod order;
pub mod state_machine;
pub mod store;

pub use order::{
    AssetAmount, BtcFunding, EscrowRecord, EscrowSide, HtlcRecord, Order, OrderStatus,
    PartyIdentity, StatusChange, SwapDirection, SwapTimelocks, TransactionRefs, TxRef,
};
pub use state_machine::{CancelTrigger, Claim, NewOrder};
pub use store::OrderStore;
