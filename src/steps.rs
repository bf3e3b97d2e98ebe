//! # Swap Steps
//!
//! One function per CLI command. Each step loads the order, checks what is
//! already recorded, performs at most one on-chain action, applies the
//! matching transition and saves the order.
//!
//! Steps are idempotent. When the outcome of a step is already recorded the
//! step logs a warning and returns the stored order without touching either
//! chain. Every guard that could reject the transition runs before anything
//! is broadcast, so a rejected step leaves both the chains and the store
//! unchanged.

use crate::error::{SwapError, SwapResult};
use crate::htlc::{self, AddressKind, HtlcOutput};
use crate::orders::state_machine::{self, CancelTrigger, Claim, NewOrder};
use crate::orders::{BtcFunding, EscrowRecord, HtlcRecord, Order, OrderStatus, OrderStore, PartyIdentity};
use crate::secret::Secret;
use crate::services::{ChainGateway, EscrowClient};
use crate::transactions::funding::funder_address;
use crate::transactions::{
    build_claim, build_funding, build_refund, FundingRequest, SpendRequest, TransactionArtifact, Utxo,
};
use crate::utils;
use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, PrivateKey, Transaction, Txid};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

fn save(store: &OrderStore, order: Order) -> SwapResult<Order> {
    store.save(&order)?;
    Ok(order)
}

fn missing(order: &Order, what: &str) -> SwapError {
    SwapError::InvalidOrderState {
        order_id: order.order_id.clone(),
        status: order.status.to_string(),
        reason: format!("no {} recorded", what),
    }
}

/// Rebuild the HTLC output from the stored redeem script and check it still
/// matches the stored address
fn stored_htlc(order: &Order) -> SwapResult<HtlcOutput> {
    let record = order.htlc.as_ref().ok_or_else(|| missing(order, "HTLC"))?;
    let output = htlc::script::from_redeem_script(
        record.redeem_script.clone(),
        order.network,
        record.is_segwit(),
    )?;
    if output.address.to_string() != record.address {
        return Err(SwapError::address(
            record.address.clone(),
            format!("redeem script derives {}", output.address),
        ));
    }
    Ok(output)
}

fn funding_utxo(order: &Order, output: &HtlcOutput) -> SwapResult<Utxo> {
    let funding = order
        .transactions
        .btc_funding
        .as_ref()
        .ok_or_else(|| missing(order, "HTLC funding"))?;
    let outpoint = funding.outpoint()?;
    Ok(Utxo {
        txid: outpoint.txid,
        vout: outpoint.vout,
        value: funding.amount,
        script_pubkey: output.locking_script.clone(),
        address: output.address.to_string(),
    })
}

/// Broadcast a built transaction and return the txid to record
async fn broadcast<G: ChainGateway + ?Sized>(
    gateway: &G,
    artifact: &TransactionArtifact,
) -> SwapResult<Txid> {
    let reported = gateway.broadcast(&artifact.raw_hex).await?;
    if reported != artifact.txid {
        log::warn!(
            "Gateway reported txid {} for transaction {}",
            reported,
            artifact.txid
        );
    }
    Ok(artifact.txid)
}

/// Create and persist a new order
pub fn create_order(store: &OrderStore, params: NewOrder, now: DateTime<Utc>) -> SwapResult<Order> {
    let order = state_machine::create_order(params, now)?;
    store.create(&order)?;
    log::info!(
        "Created {} order {} with hashlock {}",
        order.direction,
        order.order_id,
        order.hashlock
    );
    Ok(order)
}

/// Record the taker on a `CREATED` order
pub fn fill_order(
    store: &OrderStore,
    order_id: &str,
    taker: PartyIdentity,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    let next = state_machine::fill(&order, taker, now)?;
    if next == order {
        log::warn!("Order {} is already filled by this taker", order_id);
        return Ok(order);
    }
    log::info!("Order {} filled", order_id);
    save(store, next)
}

/// Derive the HTLC for a filled order and record it
pub fn create_htlc(
    store: &OrderStore,
    order_id: &str,
    segwit: bool,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(existing) = &order.htlc {
        log::warn!("HTLC {} already recorded for order {}", existing.address, order_id);
        return Ok(order);
    }

    let config = order.htlc_config(segwit)?;
    let output = htlc::build(&config)?;
    let record = HtlcRecord::from_output(
        &output,
        &config.sender_pubkey,
        &config.receiver_pubkey,
        order.timelocks.btc_locktime,
    );
    let next = state_machine::attach_htlc(&order, record, now)?;
    log::info!(
        "HTLC for order {}: {} ({:?})",
        order_id,
        output.address,
        output.kind()
    );
    save(store, next)
}

/// Apply `FILLED -> FUNDED` if both chains are now locked
fn try_mark_funded(order: Order, now: DateTime<Utc>) -> SwapResult<Order> {
    let both_locked = order.status == OrderStatus::Filled
        && order.escrow.is_some()
        && order.transactions.btc_funding.is_some();
    if !both_locked {
        return Ok(order);
    }
    let next = state_machine::mark_funded(&order, now)?;
    log::info!("Order {} is funded on both chains", next.order_id);
    Ok(next)
}

/// Fund the HTLC from the wallet of `key`.
///
/// An HTLC output of exactly the order amount already on chain is adopted
/// instead of funding twice.
pub async fn fund_htlc<G: ChainGateway + ?Sized>(
    store: &OrderStore,
    gateway: &G,
    order_id: &str,
    key: &PrivateKey,
    funder_kind: AddressKind,
    fee_rate: f64,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(funding) = &order.transactions.btc_funding {
        log::warn!("HTLC of order {} already funded by {}", order_id, funding.txid);
        return Ok(order);
    }
    let output = stored_htlc(&order)?;
    let amount = order.amounts.btc_sats;

    let existing = gateway
        .get_utxos(&output.address)
        .await?
        .into_iter()
        .find(|utxo| utxo.value == amount);
    if let Some(utxo) = existing {
        log::warn!(
            "HTLC {} already holds {} sats in {}; recording it",
            output.address,
            amount,
            utxo.outpoint()
        );
        let funding = BtcFunding {
            txid: utxo.txid.to_string(),
            vout: utxo.vout,
            amount,
            fee: 0,
        };
        let next = state_machine::record_btc_funding(&order, funding, &[], now)?;
        return save(store, try_mark_funded(next, now)?);
    }

    let funder = htlc::script::parse_address(
        &funder_address(key, funder_kind, order.network)?.to_string(),
        order.network,
    )?;
    let utxos = gateway.get_utxos(&funder.address).await?;
    let spent: HashSet<OutPoint> = order.spent_outpoints.iter().copied().collect();

    let mut previous_txs: HashMap<Txid, Transaction> = HashMap::new();
    if funder_kind == AddressKind::Legacy {
        for utxo in utxos.iter().filter(|utxo| !spent.contains(&utxo.outpoint())) {
            if !previous_txs.contains_key(&utxo.txid) {
                let tx = gateway.get_transaction(&utxo.txid).await?;
                previous_txs.insert(utxo.txid, tx);
            }
        }
    }

    let funding_tx = build_funding(
        &FundingRequest {
            htlc_address: &output.address,
            amount,
            fee_rate,
            funder: &funder,
            utxos: &utxos,
            previous_txs: &previous_txs,
            spent: &spent,
        },
        key,
    )?;

    // Guards run before broadcasting; the recorded order is built from the
    // same data once the txid is known.
    let funding = |txid: Txid| BtcFunding {
        txid: txid.to_string(),
        vout: funding_tx.htlc_vout,
        amount,
        fee: funding_tx.artifact.fee,
    };
    state_machine::record_btc_funding(&order, funding(funding_tx.artifact.txid), &funding_tx.spent_outpoints, now)?;

    let txid = broadcast(gateway, &funding_tx.artifact).await?;
    log::info!(
        "Funded HTLC {} with {} (fee {} sats)",
        output.address,
        utils::amount::format_dual(amount),
        funding_tx.artifact.fee
    );
    let next = state_machine::record_btc_funding(&order, funding(txid), &funding_tx.spent_outpoints, now)?;
    save(store, try_mark_funded(next, now)?)
}

/// Deploy the EVM escrow for this order's direction
pub async fn create_escrow<E: EscrowClient + ?Sized>(
    store: &OrderStore,
    client: &E,
    order_id: &str,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(existing) = &order.escrow {
        log::warn!("Escrow {} already recorded for order {}", existing.address, order_id);
        return Ok(order);
    }
    if order.status != OrderStatus::Filled {
        return Err(SwapError::InvalidOrderState {
            order_id: order.order_id.clone(),
            status: order.status.to_string(),
            reason: "create escrow requires status FILLED".to_string(),
        });
    }

    let side = order.escrow_side();
    let immutables = order.escrow_immutables()?;
    let deployment = client.create_escrow(side, &immutables).await?;
    let record = EscrowRecord {
        address: deployment.address.to_checksum(None),
        side,
        deployed_at: deployment.deployed_at,
    };
    let next = state_machine::record_escrow(&order, record, &deployment.tx_hash, now)?;
    log::info!(
        "Escrow for order {}: {}",
        order_id,
        utils::address::format_short(&deployment.address.to_checksum(None))
    );
    save(store, try_mark_funded(next, now)?)
}

/// Claim the HTLC with the secret, paying `destination`
pub async fn claim_btc<G: ChainGateway + ?Sized>(
    store: &OrderStore,
    gateway: &G,
    order_id: &str,
    key: &PrivateKey,
    destination: &str,
    fee_rate: f64,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(claim) = &order.transactions.btc_claim {
        log::warn!("HTLC of order {} already claimed in {}", order_id, claim.txid);
        return Ok(order);
    }
    let secret = *state_machine::ensure_claimable(&order)?;
    let output = stored_htlc(&order)?;
    let utxo = funding_utxo(&order, &output)?;
    let destination = htlc::script::parse_address(destination, order.network)?;

    let artifact = build_claim(
        &SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &destination,
            fee_rate,
        },
        &secret,
        key,
    )?;
    let txid = broadcast(gateway, &artifact).await?;
    log::info!(
        "Claimed HTLC {} in {} (fee {} sats)",
        output.address,
        utils::txid::format_short(&txid.to_string()),
        artifact.fee
    );
    let next = state_machine::complete(&order, Claim::Bitcoin { txid: txid.to_string() }, now)?;
    save(store, next)
}

/// Withdraw from the EVM escrow with the secret
pub async fn withdraw_evm<E: EscrowClient + ?Sized>(
    store: &OrderStore,
    client: &E,
    order_id: &str,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(withdrawal) = &order.transactions.evm_withdraw {
        log::warn!("Escrow of order {} already withdrawn in {}", order_id, withdrawal.txid);
        return Ok(order);
    }
    let secret = *state_machine::ensure_claimable(&order)?;
    let escrow = order.escrow.as_ref().ok_or_else(|| missing(&order, "escrow"))?;
    let address = crate::escrow::parse_evm_address(&escrow.address)?;

    let tx_hash = client
        .withdraw(address, &secret, &order.escrow_immutables()?)
        .await?;
    let next = state_machine::complete(&order, Claim::Evm { txid: tx_hash }, now)?;
    save(store, next)
}

/// Recover the secret from the HTLC claim transaction.
///
/// The claim is located from `claim_txid`, the recorded claim, or the
/// spender of the funding output, in that order. A claim found on chain is
/// recorded too, completing a funded order.
pub async fn extract_secret<G: ChainGateway + ?Sized>(
    store: &OrderStore,
    gateway: &G,
    order_id: &str,
    claim_txid: Option<Txid>,
    now: DateTime<Utc>,
) -> SwapResult<(Order, Secret)> {
    let order = store.load(order_id)?;
    let output = stored_htlc(&order)?;

    let recorded = match &order.transactions.btc_claim {
        Some(claim) => Some(claim.txid.parse::<Txid>().map_err(|e| {
            SwapError::transaction(format!("Invalid recorded claim txid {}: {}", claim.txid, e))
        })?),
        None => None,
    };
    let txid = match claim_txid.or(recorded) {
        Some(txid) => txid,
        None => {
            let funding = funding_utxo(&order, &output)?;
            gateway
                .get_spending_txid(&funding.outpoint())
                .await?
                .ok_or_else(|| SwapError::secret_not_found("the HTLC output is unspent"))?
        }
    };

    let tx = gateway.get_transaction(&txid).await?;
    let secret = htlc::extract_verified_secret(&tx, &output.redeem_script, &order.hashlock)?;
    log::info!("Recovered secret for order {} from {}", order_id, txid);

    let mut next = state_machine::record_secret(&order, secret, now)?;
    let claimable = matches!(next.status, OrderStatus::Funded | OrderStatus::Completed);
    if claimable && next.transactions.btc_claim.is_none() {
        next = state_machine::complete(&next, Claim::Bitcoin { txid: txid.to_string() }, now)?;
    }
    if next == order {
        return Ok((order, secret));
    }
    Ok((save(store, next)?, secret))
}

/// Refund the HTLC to `destination` once its locktime has passed
pub async fn refund_btc<G: ChainGateway + ?Sized>(
    store: &OrderStore,
    gateway: &G,
    order_id: &str,
    key: &PrivateKey,
    destination: &str,
    fee_rate: f64,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(refund) = &order.transactions.btc_refund {
        log::warn!("HTLC of order {} already refunded in {}", order_id, refund.txid);
        return Ok(order);
    }
    let tip_height = match order.timelocks.btc_locktime() {
        LockTime::Blocks(_) => Some(gateway.tip_height().await?),
        LockTime::Seconds(_) => None,
    };
    state_machine::ensure_refundable(&order, now, tip_height)?;

    let output = stored_htlc(&order)?;
    let utxo = funding_utxo(&order, &output)?;
    let destination = htlc::script::parse_address(destination, order.network)?;
    let artifact = build_refund(
        &SpendRequest {
            htlc: &output,
            utxo: &utxo,
            destination: &destination,
            fee_rate,
        },
        key,
    )?;
    let txid = broadcast(gateway, &artifact).await?;
    log::info!("Refunded HTLC {} in {}", output.address, txid);

    let next = state_machine::cancel(
        &order,
        CancelTrigger::BitcoinRefund { txid: txid.to_string() },
        now,
        tip_height,
    )?;
    save(store, next)
}

/// Cancel the EVM escrow once its cancellation window has opened
pub async fn cancel_evm<E: EscrowClient + ?Sized>(
    store: &OrderStore,
    client: &E,
    order_id: &str,
    now: DateTime<Utc>,
) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    if let Some(cancel) = &order.transactions.evm_cancel {
        log::warn!("Escrow of order {} already cancelled in {}", order_id, cancel.txid);
        return Ok(order);
    }
    state_machine::ensure_evm_cancellable(&order, now)?;
    let escrow = order.escrow.as_ref().ok_or_else(|| missing(&order, "escrow"))?;
    let address = crate::escrow::parse_evm_address(&escrow.address)?;

    let tx_hash = client.cancel(address, &order.escrow_immutables()?).await?;
    let next = state_machine::cancel(&order, CancelTrigger::EvmCancel { txid: tx_hash }, now, None)?;
    save(store, next)
}

/// Cancel an order that never locked funds once its cancellation period passed
pub fn expire_order(store: &OrderStore, order_id: &str, now: DateTime<Utc>) -> SwapResult<Order> {
    let order = store.load(order_id)?;
    let next = state_machine::cancel(&order, CancelTrigger::Expired, now, None)?;
    if next == order {
        log::warn!("Order {} is already cancelled", order_id);
        return Ok(order);
    }
    log::info!("Order {} expired", order_id);
    save(store, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::{EscrowImmutables, Timelocks};
    use crate::orders::{AssetAmount, SwapDirection};
    use crate::services::{EscrowDeployment, RecommendedFees, TxStatus};
    use alloy::primitives::Address as EvmAddress;
    use async_trait::async_trait;
    use bitcoin::consensus::encode::deserialize_hex;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::{Address, Network};
    use std::str::FromStr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChain {
        utxos: Mutex<HashMap<String, Vec<Utxo>>>,
        txs: Mutex<HashMap<Txid, Transaction>>,
        spends: Mutex<HashMap<OutPoint, Txid>>,
        broadcasts: Mutex<Vec<Txid>>,
        tip: Mutex<u32>,
    }

    impl FakeChain {
        fn add_utxo(&self, address: &Address, seed: u8, value: u64) {
            let utxo = Utxo {
                txid: Txid::from_str(&format!("{:02x}", seed).repeat(32)).unwrap(),
                vout: 0,
                value,
                script_pubkey: address.script_pubkey(),
                address: address.to_string(),
            };
            self.utxos
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .push(utxo);
        }

        fn broadcast_count(&self) -> usize {
            self.broadcasts.lock().unwrap().len()
        }

        fn set_tip(&self, height: u32) {
            *self.tip.lock().unwrap() = height;
        }
    }

    #[async_trait]
    impl ChainGateway for FakeChain {
        async fn get_utxos(&self, address: &Address) -> SwapResult<Vec<Utxo>> {
            Ok(self
                .utxos
                .lock()
                .unwrap()
                .get(&address.to_string())
                .cloned()
                .unwrap_or_default())
        }

        async fn get_transaction(&self, txid: &Txid) -> SwapResult<Transaction> {
            self.txs
                .lock()
                .unwrap()
                .get(txid)
                .cloned()
                .ok_or_else(|| SwapError::transaction("unknown transaction"))
        }

        async fn get_tx_status(&self, _txid: &Txid) -> SwapResult<TxStatus> {
            Ok(TxStatus {
                confirmed: false,
                block_height: None,
                block_time: None,
            })
        }

        async fn get_spending_txid(&self, outpoint: &OutPoint) -> SwapResult<Option<Txid>> {
            Ok(self.spends.lock().unwrap().get(outpoint).copied())
        }

        async fn broadcast(&self, raw_hex: &str) -> SwapResult<Txid> {
            let tx: Transaction = deserialize_hex(raw_hex).unwrap();
            let txid = tx.compute_txid();
            for input in &tx.input {
                self.spends.lock().unwrap().insert(input.previous_output, txid);
            }
            self.txs.lock().unwrap().insert(txid, tx);
            self.broadcasts.lock().unwrap().push(txid);
            Ok(txid)
        }

        async fn fee_rates(&self) -> SwapResult<RecommendedFees> {
            Ok(RecommendedFees {
                fastest_fee: 10.0,
                half_hour_fee: 5.0,
                hour_fee: 3.0,
                economy_fee: 2.0,
                minimum_fee: 1.0,
            })
        }

        async fn tip_height(&self) -> SwapResult<u32> {
            Ok(*self.tip.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct FakeEscrow {
        calls: Mutex<Vec<String>>,
    }

    const DEPLOYED_AT: u32 = 1_750_000_100;

    #[async_trait]
    impl EscrowClient for FakeEscrow {
        async fn create_escrow(
            &self,
            _side: crate::orders::EscrowSide,
            immutables: &EscrowImmutables,
        ) -> SwapResult<EscrowDeployment> {
            assert_eq!(immutables.timelocks.deployed_at, 0);
            self.calls.lock().unwrap().push("create".to_string());
            Ok(EscrowDeployment {
                address: EvmAddress::repeat_byte(0x42),
                tx_hash: format!("0x{}", "ab".repeat(32)),
                deployed_at: DEPLOYED_AT,
            })
        }

        async fn withdraw(
            &self,
            escrow: EvmAddress,
            secret: &Secret,
            immutables: &EscrowImmutables,
        ) -> SwapResult<String> {
            assert_eq!(escrow, EvmAddress::repeat_byte(0x42));
            assert_eq!(immutables.timelocks.deployed_at, DEPLOYED_AT);
            self.calls
                .lock()
                .unwrap()
                .push(format!("withdraw:{}", secret.to_hex()));
            Ok(format!("0x{}", "cd".repeat(32)))
        }

        async fn cancel(&self, _escrow: EvmAddress, _immutables: &EscrowImmutables) -> SwapResult<String> {
            self.calls.lock().unwrap().push("cancel".to_string());
            Ok(format!("0x{}", "ef".repeat(32)))
        }
    }

    fn key(seed: u8) -> PrivateKey {
        PrivateKey::from_slice(&[seed; 32], Network::Regtest).unwrap()
    }

    fn party(seed: u8, evm: &str) -> PartyIdentity {
        let secp = Secp256k1::new();
        PartyIdentity::new(evm, &key(seed).public_key(&secp).to_string()).unwrap()
    }

    fn wallet(seed: u8) -> Address {
        funder_address(&key(seed), AddressKind::SegwitV0, Network::Regtest).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000, 0).unwrap()
    }

    // Maker (seed 1) sells EVM tokens for BTC; taker (seed 2) funds the HTLC
    fn filled_order(store: &OrderStore, id: &str, btc_locktime: u32) -> Order {
        create_order(
            store,
            NewOrder {
                order_id: Some(id.to_string()),
                direction: SwapDirection::EvmToBtc,
                network: Network::Regtest,
                maker: party(1, "0x00000000000000000000000000000000000000aa"),
                amounts: AssetAmount {
                    evm_token: "0x0000000000000000000000000000000000000000".to_string(),
                    evm_amount: 1_000_000_000_000_000,
                    evm_safety_deposit: 1_000,
                    btc_sats: 50_000,
                },
                secret: None,
                hashlock: None,
                evm_timelocks: Timelocks::new(60, 1_800, 3_600).unwrap(),
                btc_locktime,
            },
            t0(),
        )
        .unwrap();
        fill_order(store, id, party(2, "0x00000000000000000000000000000000000000bb"), t0()).unwrap();
        create_htlc(store, id, true, t0()).unwrap()
    }

    #[tokio::test]
    async fn test_full_swap_with_secret_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let chain = FakeChain::default();
        let escrow = FakeEscrow::default();
        chain.add_utxo(&wallet(2), 0x11, 100_000);

        let order = filled_order(&store, "swap-1", 200);
        assert!(order.htlc.as_ref().unwrap().address.starts_with("bcrt1q"));

        let funded = fund_htlc(&store, &chain, "swap-1", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap();
        assert_eq!(funded.status, OrderStatus::Filled);
        assert_eq!(funded.transactions.btc_funding.as_ref().unwrap().amount, 50_000);
        assert_eq!(funded.spent_outpoints.len(), 1);

        let locked = create_escrow(&store, &escrow, "swap-1", t0()).await.unwrap();
        assert_eq!(locked.status, OrderStatus::Funded);
        assert_eq!(locked.timelocks.evm.deployed_at, DEPLOYED_AT);

        let maker_wallet = wallet(1).to_string();
        let completed = claim_btc(&store, &chain, "swap-1", &key(1), &maker_wallet, 2.0, t0())
            .await
            .unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(chain.broadcast_count(), 2);

        // The taker's view: secret and claim unknown
        let secret = completed.secret.unwrap();
        let mut taker_view = completed.clone();
        taker_view.secret = None;
        taker_view.transactions.btc_claim = None;
        store.save(&taker_view).unwrap();

        let (recovered, found) = extract_secret(&store, &chain, "swap-1", None, t0()).await.unwrap();
        assert_eq!(found, secret);
        assert_eq!(recovered.secret, Some(secret));
        assert!(recovered.transactions.btc_claim.is_some());

        let withdrawn = withdraw_evm(&store, &escrow, "swap-1", t0()).await.unwrap();
        assert!(withdrawn.transactions.evm_withdraw.is_some());
        assert_eq!(withdrawn.status, OrderStatus::Completed);
        assert_eq!(
            escrow.calls.lock().unwrap().as_slice(),
            &["create".to_string(), format!("withdraw:{}", secret.to_hex())]
        );
    }

    #[tokio::test]
    async fn test_steps_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let chain = FakeChain::default();
        let escrow = FakeEscrow::default();
        chain.add_utxo(&wallet(2), 0x11, 100_000);
        filled_order(&store, "swap-2", 200);

        let first = fund_htlc(&store, &chain, "swap-2", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap();
        let again = fund_htlc(&store, &chain, "swap-2", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(chain.broadcast_count(), 1);

        create_escrow(&store, &escrow, "swap-2", t0()).await.unwrap();
        create_escrow(&store, &escrow, "swap-2", t0()).await.unwrap();
        assert_eq!(escrow.calls.lock().unwrap().len(), 1);

        let destination = wallet(1).to_string();
        claim_btc(&store, &chain, "swap-2", &key(1), &destination, 2.0, t0()).await.unwrap();
        claim_btc(&store, &chain, "swap-2", &key(1), &destination, 2.0, t0()).await.unwrap();
        assert_eq!(chain.broadcast_count(), 2);

        // Re-deriving the HTLC never replaces the recorded one
        let order = create_htlc(&store, "swap-2", false, t0()).unwrap();
        assert!(order.htlc.unwrap().is_segwit());
    }

    #[tokio::test]
    async fn test_existing_htlc_output_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let chain = FakeChain::default();
        let order = filled_order(&store, "swap-3", 200);
        let htlc_address = Address::from_str(&order.htlc.unwrap().address)
            .unwrap()
            .assume_checked();
        chain.add_utxo(&htlc_address, 0x33, 50_000);

        let funded = fund_htlc(&store, &chain, "swap-3", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap();
        assert_eq!(chain.broadcast_count(), 0);
        assert_eq!(
            funded.transactions.btc_funding.unwrap().txid,
            "33".repeat(32)
        );
    }

    #[tokio::test]
    async fn test_insufficient_wallet_leaves_order_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let chain = FakeChain::default();
        chain.add_utxo(&wallet(2), 0x11, 10_000);
        let before = filled_order(&store, "swap-4", 200);

        let err = fund_htlc(&store, &chain, "swap-4", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InsufficientFunds { .. }));
        assert_eq!(store.load("swap-4").unwrap(), before);
        assert_eq!(chain.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_refund_waits_for_height() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let chain = FakeChain::default();
        chain.add_utxo(&wallet(2), 0x11, 100_000);
        filled_order(&store, "swap-5", 200);
        fund_htlc(&store, &chain, "swap-5", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap();

        let refund_to = wallet(2).to_string();
        chain.set_tip(150);
        let err = refund_btc(&store, &chain, "swap-5", &key(2), &refund_to, 2.0, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidOrderState { .. }));
        assert_eq!(chain.broadcast_count(), 1);

        chain.set_tip(250);
        let refunded = refund_btc(&store, &chain, "swap-5", &key(2), &refund_to, 2.0, t0())
            .await
            .unwrap();
        assert_eq!(refunded.status, OrderStatus::Cancelled);
        let refund_txid: Txid = refunded.transactions.btc_refund.unwrap().txid.parse().unwrap();
        let refund_tx = chain.get_transaction(&refund_txid).await.unwrap();
        assert_eq!(refund_tx.lock_time, LockTime::from_consensus(200));

        // Nothing revealed: extraction from the refund finds no secret
        let err = extract_secret(&store, &chain, "swap-5", Some(refund_txid), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::SecretNotFound { .. }));
    }

    #[tokio::test]
    async fn test_evm_cancel_window_and_completed_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let chain = FakeChain::default();
        let escrow = FakeEscrow::default();
        chain.add_utxo(&wallet(2), 0x11, 100_000);
        filled_order(&store, "swap-6", 200);
        create_escrow(&store, &escrow, "swap-6", t0()).await.unwrap();

        let too_early = chrono::Duration::seconds(3_000);
        assert!(cancel_evm(&store, &escrow, "swap-6", t0() + too_early).await.is_err());

        let open = DateTime::from_timestamp(DEPLOYED_AT as i64 + 3_600, 0).unwrap();
        let cancelled = cancel_evm(&store, &escrow, "swap-6", open).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.transactions.evm_cancel.is_some());

        // A completed order is never cancelled
        filled_order(&store, "swap-7", 200);
        fund_htlc(&store, &chain, "swap-7", &key(2), AddressKind::SegwitV0, 2.0, t0())
            .await
            .unwrap();
        create_escrow(&store, &escrow, "swap-7", t0()).await.unwrap();
        withdraw_evm(&store, &escrow, "swap-7", t0()).await.unwrap();
        let calls_before = escrow.calls.lock().unwrap().len();
        assert!(cancel_evm(&store, &escrow, "swap-7", open).await.is_err());
        assert_eq!(escrow.calls.lock().unwrap().len(), calls_before);
    }

    #[test]
    fn test_expire_unfunded_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        filled_order(&store, "swap-8", 200);

        assert!(expire_order(&store, "swap-8", t0()).is_err());
        let later = t0() + chrono::Duration::seconds(3_600);
        let expired = expire_order(&store, "swap-8", later).unwrap();
        assert_eq!(expired.status, OrderStatus::Cancelled);
        assert_eq!(expire_order(&store, "swap-8", later).unwrap(), expired);
    }
}
