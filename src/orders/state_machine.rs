//! # Order State Machine
//!
//! ```text
//! CREATED ──fill──> FILLED ──mark_funded──> FUNDED ──complete──> COMPLETED
//!    │                 │                      │
//!    └─────────────────┴──────cancel──────────┴──────> CANCELLED
//! ```
//!
//! Every transition takes the current order by reference and returns the
//! next version. On error the caller still holds the untouched original, so
//! a failed transition never reaches the store.
//!
//! Transitions are replay-safe: applying a step whose outcome is already
//! recorded returns the order unchanged, while applying it with different
//! data fails with [`SwapError::InvalidOrderState`].

use super::order::{
    AssetAmount, BtcFunding, EscrowRecord, HtlcRecord, Order, OrderStatus, PartyIdentity,
    StatusChange, SwapDirection, SwapTimelocks, TransactionRefs, TxRef,
};
use crate::config::fees::DUST_THRESHOLD_SATS;
use crate::error::{SwapError, SwapResult};
use crate::escrow::{parse_evm_address, Timelocks};
use crate::htlc::script::decode_redeem_script;
use crate::secret::{self, Hashlock, Secret};
use crate::utils::time::{format_duration, format_unix};
use bitcoin::{absolute::LockTime, Network, OutPoint};
use chrono::{DateTime, Utc};

/// Parameters of a new order
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Random UUID when absent
    pub order_id: Option<String>,
    pub direction: SwapDirection,
    pub network: Network,
    pub maker: PartyIdentity,
    pub amounts: AssetAmount,
    /// Generated when neither secret nor hashlock is given
    pub secret: Option<Secret>,
    /// For orders whose secret is held outside this record
    pub hashlock: Option<Hashlock>,
    pub evm_timelocks: Timelocks,
    pub btc_locktime: u32,
}

/// A claim on one chain, revealing or using the secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// HTLC claim transaction
    Bitcoin { txid: String },
    /// Escrow withdraw transaction
    Evm { txid: String },
}

/// What allows an order to be cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTrigger {
    /// HTLC refund after the CLTV locktime
    BitcoinRefund { txid: String },
    /// Escrow cancel after the cancellation window opens
    EvmCancel { txid: String },
    /// Nothing locked on either chain and the cancellation period has passed
    Expired,
}

fn invalid(order: &Order, reason: impl Into<String>) -> SwapError {
    SwapError::InvalidOrderState {
        order_id: order.order_id.clone(),
        status: order.status.to_string(),
        reason: reason.into(),
    }
}

fn touch(order: &Order, now: DateTime<Utc>) -> Order {
    let mut next = order.clone();
    next.updated_at = now;
    next
}

fn advance(order: &Order, to: OrderStatus, note: &str, now: DateTime<Utc>) -> Order {
    let mut next = touch(order, now);
    next.history.push(StatusChange {
        from: Some(order.status),
        to,
        at: now,
        note: note.to_string(),
    });
    next.status = to;
    next
}

fn require_status(order: &Order, allowed: &[OrderStatus], action: &str) -> SwapResult<()> {
    if allowed.contains(&order.status) {
        return Ok(());
    }
    let expected: Vec<String> = allowed.iter().map(ToString::to_string).collect();
    Err(invalid(
        order,
        format!("{} requires status {}", action, expected.join(" or ")),
    ))
}

/// Validate parameters and create an order in `CREATED`
pub fn create_order(params: NewOrder, now: DateTime<Utc>) -> SwapResult<Order> {
    params.evm_timelocks.validate()?;
    if params.btc_locktime == 0 {
        return Err(SwapError::config("Bitcoin locktime must be non-zero"));
    }
    if params.amounts.btc_sats <= DUST_THRESHOLD_SATS {
        return Err(SwapError::config(format!(
            "BTC amount {} sats must exceed the dust threshold of {} sats",
            params.amounts.btc_sats, DUST_THRESHOLD_SATS
        )));
    }
    if params.amounts.evm_amount == 0 {
        return Err(SwapError::config("EVM amount must be non-zero"));
    }
    parse_evm_address(&params.amounts.evm_token)?;

    let (secret, hashlock) = match (params.secret, params.hashlock) {
        (Some(secret), Some(hashlock)) => {
            secret::verify(&secret, &hashlock)?;
            (Some(secret), hashlock)
        }
        (Some(secret), None) => (Some(secret), secret::hash(&secret)),
        (None, Some(hashlock)) => (None, hashlock),
        (None, None) => {
            let secret = secret::generate_secret();
            (Some(secret), secret::hash(&secret))
        }
    };

    let order_id = params
        .order_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(Order {
        order_id,
        direction: params.direction,
        network: params.network,
        maker: params.maker,
        taker: None,
        amounts: params.amounts,
        hashlock,
        secret,
        timelocks: SwapTimelocks {
            evm: Timelocks {
                deployed_at: 0,
                ..params.evm_timelocks
            },
            btc_locktime: params.btc_locktime,
        },
        status: OrderStatus::Created,
        htlc: None,
        escrow: None,
        transactions: TransactionRefs::default(),
        spent_outpoints: Vec::new(),
        created_at: now,
        updated_at: now,
        history: vec![StatusChange {
            from: None,
            to: OrderStatus::Created,
            at: now,
            note: "order created".to_string(),
        }],
    })
}

/// `CREATED -> FILLED`: record the taker
pub fn fill(order: &Order, taker: PartyIdentity, now: DateTime<Utc>) -> SwapResult<Order> {
    if let Some(existing) = &order.taker {
        if *existing == taker {
            return Ok(order.clone());
        }
        return Err(invalid(order, "order already has a different taker"));
    }
    require_status(order, &[OrderStatus::Created], "fill")?;
    if taker.btc_pubkey == order.maker.btc_pubkey {
        return Err(invalid(order, "taker and maker Bitcoin keys must differ"));
    }
    // Both keys must parse before the HTLC can be derived from them
    taker.btc()?;
    taker.evm()?;

    let mut next = advance(order, OrderStatus::Filled, "taker joined", now);
    next.taker = Some(taker);
    Ok(next)
}

/// Attach the derived HTLC. Allowed once, in `FILLED`.
pub fn attach_htlc(order: &Order, record: HtlcRecord, now: DateTime<Utc>) -> SwapResult<Order> {
    if let Some(existing) = &order.htlc {
        if *existing == record {
            return Ok(order.clone());
        }
        return Err(invalid(order, "HTLC is already attached and cannot change"));
    }
    require_status(order, &[OrderStatus::Filled], "create HTLC")?;

    let terms = decode_redeem_script(&record.redeem_script)?;
    if terms.hashlock != order.hashlock {
        return Err(invalid(
            order,
            format!(
                "HTLC hashlock {} differs from order hashlock {}",
                terms.hashlock, order.hashlock
            ),
        ));
    }
    if terms.locktime != LockTime::from_consensus(order.timelocks.btc_locktime) {
        return Err(invalid(order, "HTLC locktime differs from order locktime"));
    }
    let sender = order.btc_sender().ok_or_else(|| invalid(order, "HTLC sender unknown"))?;
    let receiver = order.btc_receiver().ok_or_else(|| invalid(order, "HTLC receiver unknown"))?;
    if terms.sender_pubkey != sender.btc()? || terms.receiver_pubkey != receiver.btc()? {
        return Err(invalid(order, "HTLC keys do not match the order parties"));
    }

    let mut next = touch(order, now);
    next.htlc = Some(record);
    Ok(next)
}

/// Record the deployed escrow. Allowed once, in `FILLED`.
pub fn record_escrow(
    order: &Order,
    record: EscrowRecord,
    creation_txid: &str,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    if let Some(existing) = &order.escrow {
        if existing.address.eq_ignore_ascii_case(&record.address) {
            return Ok(order.clone());
        }
        return Err(invalid(order, "a different escrow is already recorded"));
    }
    require_status(order, &[OrderStatus::Filled], "create escrow")?;
    if record.side != order.escrow_side() {
        return Err(invalid(order, "escrow side does not match the swap direction"));
    }

    let mut next = touch(order, now);
    next.timelocks.evm.deployed_at = record.deployed_at;
    next.escrow = Some(record);
    next.transactions.evm_escrow = Some(TxRef::new(creation_txid, now));
    Ok(next)
}

/// Record the broadcast HTLC funding and the outpoints it consumed
pub fn record_btc_funding(
    order: &Order,
    funding: BtcFunding,
    spent: &[OutPoint],
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    if let Some(existing) = &order.transactions.btc_funding {
        if *existing == funding {
            return Ok(order.clone());
        }
        return Err(invalid(
            order,
            format!("HTLC already funded by {}", existing.txid),
        ));
    }
    require_status(order, &[OrderStatus::Filled], "fund HTLC")?;
    if order.htlc.is_none() {
        return Err(invalid(order, "no HTLC has been created"));
    }
    if funding.amount != order.amounts.btc_sats {
        return Err(invalid(
            order,
            format!(
                "funding amount {} sats differs from order amount {} sats",
                funding.amount, order.amounts.btc_sats
            ),
        ));
    }

    let mut next = touch(order, now);
    for outpoint in spent {
        if !next.spent_outpoints.contains(outpoint) {
            next.spent_outpoints.push(*outpoint);
        }
    }
    next.transactions.btc_funding = Some(funding);
    Ok(next)
}

/// `FILLED -> FUNDED` once the HTLC, the escrow and the taker are all known
pub fn mark_funded(order: &Order, now: DateTime<Utc>) -> SwapResult<Order> {
    if order.status == OrderStatus::Funded {
        return Ok(order.clone());
    }
    require_status(order, &[OrderStatus::Filled], "mark funded")?;
    if order.htlc.is_none() {
        return Err(invalid(order, "no Bitcoin HTLC address recorded"));
    }
    if order.escrow.is_none() {
        return Err(invalid(order, "no EVM escrow address recorded"));
    }
    if order.taker.is_none() {
        return Err(invalid(order, "no taker identity recorded"));
    }
    Ok(advance(order, OrderStatus::Funded, "both chains locked", now))
}

/// Store a secret learned from the other chain, after verifying it
pub fn record_secret(order: &Order, secret: Secret, now: DateTime<Utc>) -> SwapResult<Order> {
    secret::verify(&secret, &order.hashlock)?;
    if order.secret == Some(secret) {
        return Ok(order.clone());
    }
    let mut next = touch(order, now);
    next.secret = Some(secret);
    Ok(next)
}

/// `FUNDED -> COMPLETED` on the first claim; later claims on the other chain
/// are recorded without a status change.
pub fn complete(order: &Order, claim: Claim, now: DateTime<Utc>) -> SwapResult<Order> {
    let (slot, txid) = match &claim {
        Claim::Bitcoin { txid } => (&order.transactions.btc_claim, txid),
        Claim::Evm { txid } => (&order.transactions.evm_withdraw, txid),
    };
    if let Some(existing) = slot {
        if existing.txid == *txid {
            return Ok(order.clone());
        }
        return Err(invalid(order, format!("claim already recorded as {}", existing.txid)));
    }

    ensure_claimable(order)?;

    let mut next = if order.status == OrderStatus::Funded {
        advance(order, OrderStatus::Completed, "secret revealed", now)
    } else {
        touch(order, now)
    };
    let reference = Some(TxRef::new(txid.clone(), now));
    match claim {
        Claim::Bitcoin { .. } => next.transactions.btc_claim = reference,
        Claim::Evm { .. } => next.transactions.evm_withdraw = reference,
    }
    Ok(next)
}

/// Fail unless a claim may be made now, returning the verified secret
pub fn ensure_claimable(order: &Order) -> SwapResult<&Secret> {
    require_status(order, &[OrderStatus::Funded, OrderStatus::Completed], "claim")?;
    if order.transactions.btc_funding.is_none() {
        return Err(invalid(order, "no Bitcoin funding transaction recorded"));
    }
    let secret = order
        .secret
        .as_ref()
        .ok_or_else(|| invalid(order, "secret is not known"))?;
    secret::verify(secret, &order.hashlock)?;
    Ok(secret)
}

/// Fail unless the HTLC can be refunded now
pub fn ensure_refundable(
    order: &Order,
    now: DateTime<Utc>,
    tip_height: Option<u32>,
) -> SwapResult<()> {
    if order.status == OrderStatus::Completed {
        return Err(invalid(order, "a completed order cannot be cancelled"));
    }
    if order.transactions.btc_funding.is_none() {
        return Err(invalid(order, "nothing to refund: HTLC was never funded"));
    }
    ensure_btc_refund_ready(order, now, tip_height)
}

/// Fail unless the escrow can be cancelled now
pub fn ensure_evm_cancellable(order: &Order, now: DateTime<Utc>) -> SwapResult<()> {
    if order.status == OrderStatus::Completed {
        return Err(invalid(order, "a completed order cannot be cancelled"));
    }
    if order.escrow.is_none() {
        return Err(invalid(order, "nothing to cancel: no escrow deployed"));
    }
    ensure_evm_cancel_ready(order, now)
}

/// Fail unless the HTLC refund path is open.
///
/// Height locktimes compare against the chain tip, time locktimes against
/// the wall clock.
pub fn ensure_btc_refund_ready(
    order: &Order,
    now: DateTime<Utc>,
    tip_height: Option<u32>,
) -> SwapResult<()> {
    let locktime = order.timelocks.btc_locktime();
    match locktime {
        LockTime::Blocks(height) => {
            let tip = tip_height
                .ok_or_else(|| invalid(order, "chain tip height is required for a height locktime"))?;
            if tip < height.to_consensus_u32() {
                return Err(invalid(
                    order,
                    format!("locktime height {} not reached (tip {})", height, tip),
                ));
            }
        }
        LockTime::Seconds(time) => {
            if now.timestamp() < time.to_consensus_u32() as i64 {
                return Err(invalid(
                    order,
                    format!(
                        "locktime {} not reached ({} remaining)",
                        time,
                        format_duration((time.to_consensus_u32() as i64 - now.timestamp()) as u64)
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Fail unless the escrow cancellation window is open
pub fn ensure_evm_cancel_ready(order: &Order, now: DateTime<Utc>) -> SwapResult<()> {
    let start = order
        .timelocks
        .evm
        .cancellation_start()
        .ok_or_else(|| invalid(order, "no escrow has been deployed"))?;
    if (now.timestamp() as u64) < start {
        return Err(invalid(
            order,
            format!(
                "escrow cancellation opens at {} ({} remaining)",
                format_unix(start),
                format_duration(start - now.timestamp() as u64)
            ),
        ));
    }
    Ok(())
}

/// Move to `CANCELLED`; a second cancel on the other chain is recorded
/// without a status change.
pub fn cancel(
    order: &Order,
    trigger: CancelTrigger,
    now: DateTime<Utc>,
    tip_height: Option<u32>,
) -> SwapResult<Order> {
    if order.status == OrderStatus::Completed {
        return Err(invalid(order, "a completed order cannot be cancelled"));
    }

    match &trigger {
        CancelTrigger::BitcoinRefund { txid } => {
            if let Some(existing) = &order.transactions.btc_refund {
                if existing.txid == *txid {
                    return Ok(order.clone());
                }
                return Err(invalid(order, format!("refund already recorded as {}", existing.txid)));
            }
            ensure_refundable(order, now, tip_height)?;
        }
        CancelTrigger::EvmCancel { txid } => {
            if let Some(existing) = &order.transactions.evm_cancel {
                if existing.txid == *txid {
                    return Ok(order.clone());
                }
                return Err(invalid(order, format!("cancel already recorded as {}", existing.txid)));
            }
            ensure_evm_cancellable(order, now)?;
        }
        CancelTrigger::Expired => {
            if order.status == OrderStatus::Cancelled {
                return Ok(order.clone());
            }
            if order.transactions.btc_funding.is_some() || order.escrow.is_some() {
                return Err(invalid(
                    order,
                    "funds are locked; refund or cancel on-chain instead",
                ));
            }
            let expiry = order.created_at.timestamp() + order.timelocks.evm.cancellation as i64;
            if now.timestamp() < expiry {
                return Err(invalid(order, "cancellation period has not elapsed"));
            }
        }
    }

    let mut next = if order.status == OrderStatus::Cancelled {
        touch(order, now)
    } else {
        let note = match &trigger {
            CancelTrigger::BitcoinRefund { .. } => "HTLC refunded",
            CancelTrigger::EvmCancel { .. } => "escrow cancelled",
            CancelTrigger::Expired => "order expired",
        };
        advance(order, OrderStatus::Cancelled, note, now)
    };
    match trigger {
        CancelTrigger::BitcoinRefund { txid } => {
            next.transactions.btc_refund = Some(TxRef::new(txid, now))
        }
        CancelTrigger::EvmCancel { txid } => next.transactions.evm_cancel = Some(TxRef::new(txid, now)),
        CancelTrigger::Expired => {}
    }
    Ok(next)
}
