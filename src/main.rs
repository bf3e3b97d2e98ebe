//! # htlc-swap: EVM <-> Bitcoin Atomic Swaps
//!
//! Command line driver for a cross-chain swap. Each command performs one step
//! of the swap against the order record in `ORDERS_DIR`, then exits.
//!
//! ## Swap Flow (EVM -> BTC)
//!
//! ```text
//! maker: create-order ──> taker: fill-order ──> create-htlc
//!                                                   │
//!         taker: fund-htlc  <───────────────────────┤
//!         maker: create-escrow <────────────────────┘
//!                    │
//!                    ▼  (order FUNDED)
//! maker: claim-btc (reveals secret) ──> taker: extract-secret ──> withdraw-evm
//!
//! timeouts: refund-btc (after the CLTV locktime), cancel-evm (after cancellation)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! htlc-swap create-order --direction evm-to-btc --maker-evm 0x.. --maker-btc-pubkey 02.. \
//!     --evm-amount 1000000000000000 --btc-amount 50000
//! ORDER_ID=<id> htlc-swap fill-order --taker-evm 0x.. --taker-btc-pubkey 03..
//! ORDER_ID=<id> htlc-swap create-htlc
//! ORDER_ID=<id> htlc-swap fund-htlc --fee-priority hour
//! ```
//!
//! Settings come from the environment and `.env`; see [`config::env`].

use anyhow::{bail, Context, Result};
use bitcoin::{Network, PrivateKey, Txid};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use htlc_swap::config::{self, timelocks, SwapSettings};
use htlc_swap::escrow::Timelocks;
use htlc_swap::htlc::{self, AddressKind};
use htlc_swap::orders::{AssetAmount, NewOrder, Order, OrderStore, PartyIdentity, SwapDirection};
use htlc_swap::secret::{Hashlock, Secret};
use htlc_swap::services::{
    resolve_fee_rate, AlloyEscrowClient, ChainGateway, EsploraGateway, FeePriority,
};
use htlc_swap::steps;
use htlc_swap::utils;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "htlc-swap")]
#[command(about = "Trustless EVM <-> Bitcoin swaps with hash time-locked contracts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct OrderArg {
    /// Order identifier
    #[arg(long, env = "ORDER_ID")]
    order_id: String,
}

#[derive(Args)]
struct FeeArgs {
    /// Fee rate in sat/vB, overriding estimation
    #[arg(long)]
    fee_rate: Option<f64>,
    /// Recommended rate to use: fastest, half-hour, hour, economy, minimum
    #[arg(long, default_value = "half-hour")]
    fee_priority: FeePriority,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new swap order as the maker
    CreateOrder {
        /// Order identifier (random UUID when omitted)
        #[arg(long)]
        order_id: Option<String>,
        /// evm-to-btc or btc-to-evm
        #[arg(long)]
        direction: SwapDirection,
        /// Maker EVM address
        #[arg(long)]
        maker_evm: String,
        /// Maker compressed Bitcoin public key (hex)
        #[arg(long)]
        maker_btc_pubkey: String,
        /// ERC20 token address, zero address for the native token
        #[arg(long, default_value = "0x0000000000000000000000000000000000000000")]
        evm_token: String,
        /// EVM amount in wei (or token base units)
        #[arg(long)]
        evm_amount: u128,
        /// Safety deposit in wei
        #[arg(long, default_value_t = 0)]
        safety_deposit: u128,
        /// Bitcoin amount in satoshis
        #[arg(long)]
        btc_amount: u64,
        /// Use this secret (hex) instead of generating one
        #[arg(long, conflicts_with = "hashlock")]
        secret: Option<String>,
        /// Lock to this hashlock (hex); the secret is kept outside the order
        #[arg(long)]
        hashlock: Option<String>,
        /// Private withdrawal period in seconds
        #[arg(long, default_value_t = timelocks::DEFAULT_WITHDRAWAL_SECS)]
        withdrawal: u32,
        /// Public withdrawal period in seconds
        #[arg(long, default_value_t = timelocks::DEFAULT_PUBLIC_WITHDRAWAL_SECS)]
        public_withdrawal: u32,
        /// Cancellation period in seconds
        #[arg(long, default_value_t = timelocks::DEFAULT_CANCELLATION_SECS)]
        cancellation: u32,
        /// Absolute CLTV locktime (block height or unix time); defaults to now plus two hours
        #[arg(long)]
        btc_locktime: Option<u32>,
    },
    /// Join an order as the taker
    FillOrder {
        #[command(flatten)]
        order: OrderArg,
        /// Taker EVM address
        #[arg(long)]
        taker_evm: String,
        /// Taker compressed Bitcoin public key (hex)
        #[arg(long)]
        taker_btc_pubkey: String,
    },
    /// Derive and record the Bitcoin HTLC
    CreateHtlc {
        #[command(flatten)]
        order: OrderArg,
        /// P2SH instead of P2WSH
        #[arg(long, default_value_t = false)]
        legacy: bool,
    },
    /// Fund the HTLC from the BTC_PRIVATE_KEY wallet
    FundHtlc {
        #[command(flatten)]
        order: OrderArg,
        #[command(flatten)]
        fees: FeeArgs,
        /// Spend from the key's P2PKH address instead of P2WPKH
        #[arg(long, default_value_t = false)]
        legacy_wallet: bool,
    },
    /// Deploy the EVM escrow
    CreateEscrow {
        #[command(flatten)]
        order: OrderArg,
    },
    /// Claim the HTLC with the secret
    ClaimBtc {
        #[command(flatten)]
        order: OrderArg,
        #[command(flatten)]
        fees: FeeArgs,
        /// Address receiving the claimed coins
        #[arg(long)]
        destination: String,
    },
    /// Withdraw from the EVM escrow with the secret
    WithdrawEvm {
        #[command(flatten)]
        order: OrderArg,
    },
    /// Recover the secret from the HTLC claim transaction
    ExtractSecret {
        #[command(flatten)]
        order: OrderArg,
        /// Claim transaction (defaults to the recorded claim or the HTLC spender)
        #[arg(long)]
        claim_txid: Option<String>,
    },
    /// Refund the HTLC after its locktime
    RefundBtc {
        #[command(flatten)]
        order: OrderArg,
        #[command(flatten)]
        fees: FeeArgs,
        /// Address receiving the refunded coins
        #[arg(long)]
        destination: String,
    },
    /// Cancel the EVM escrow after its cancellation period
    CancelEvm {
        #[command(flatten)]
        order: OrderArg,
    },
    /// Cancel an order that never locked funds
    ExpireOrder {
        #[command(flatten)]
        order: OrderArg,
    },
    /// Show an order
    ShowOrder {
        #[command(flatten)]
        order: OrderArg,
        /// Also query the funding transaction's confirmation status
        #[arg(long, default_value_t = false)]
        chain: bool,
    },
    /// List stored orders
    ListOrders,
    /// Check that an address is a P2SH or P2WSH address for the network
    VerifyAddress {
        address: String,
        /// Network to check against (defaults to BTC_NETWORK)
        #[arg(long)]
        network: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` must be loaded before clap reads ORDER_ID
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = SwapSettings::from_env()?;
    let store = OrderStore::new(&settings.orders_dir);

    match cli.command {
        Commands::CreateOrder {
            order_id,
            direction,
            maker_evm,
            maker_btc_pubkey,
            evm_token,
            evm_amount,
            safety_deposit,
            btc_amount,
            secret,
            hashlock,
            withdrawal,
            public_withdrawal,
            cancellation,
            btc_locktime,
        } => {
            let now = Utc::now();
            let btc_locktime = match btc_locktime {
                Some(locktime) => locktime,
                None => utils::time::unix_after(&now, timelocks::DEFAULT_BTC_LOCK_SECS)
                    .context("current time does not fit a 32-bit CLTV locktime")?,
            };
            let params = NewOrder {
                order_id,
                direction,
                network: settings.network,
                maker: PartyIdentity::new(&maker_evm, &maker_btc_pubkey)?,
                amounts: AssetAmount {
                    evm_token,
                    evm_amount,
                    evm_safety_deposit: safety_deposit,
                    btc_sats: btc_amount,
                },
                secret: secret.as_deref().map(Secret::from_str).transpose()?,
                hashlock: hashlock.as_deref().map(Hashlock::from_str).transpose()?,
                evm_timelocks: Timelocks::new(withdrawal, public_withdrawal, cancellation)?,
                btc_locktime,
            };
            let order = steps::create_order(&store, params, now)?;
            println!("📝 Order created: {}", order.order_id);
            println!("Hashlock: {}", order.hashlock);
            if let Some(secret) = &order.secret {
                println!("Secret:   {} (keep private until you claim)", secret.to_hex());
            }
            println!("Saved to {}", store.path(&order.order_id)?.display());
        }
        Commands::FillOrder {
            order,
            taker_evm,
            taker_btc_pubkey,
        } => {
            let taker = PartyIdentity::new(&taker_evm, &taker_btc_pubkey)?;
            let order = steps::fill_order(&store, &order.order_id, taker, Utc::now())?;
            print_summary(&order);
        }
        Commands::CreateHtlc { order, legacy } => {
            let order = steps::create_htlc(&store, &order.order_id, !legacy, Utc::now())?;
            if let Some(htlc) = &order.htlc {
                println!("🔒 HTLC address: {}", htlc.address);
                println!("Redeem script:  {}", htlc.redeem_script.to_hex_string());
                println!(
                    "Fund with exactly {}",
                    utils::amount::format_dual(order.amounts.btc_sats)
                );
            }
        }
        Commands::FundHtlc {
            order,
            fees,
            legacy_wallet,
        } => {
            let current = store.load(&order.order_id)?;
            let gateway = gateway_for(&settings, current.network)?;
            let key = btc_key(&settings, current.network)?;
            let fee_rate = pick_fee_rate(&gateway, &settings, &fees).await;
            let kind = if legacy_wallet {
                AddressKind::Legacy
            } else {
                AddressKind::SegwitV0
            };
            let order = steps::fund_htlc(
                &store,
                &gateway,
                &order.order_id,
                &key,
                kind,
                fee_rate,
                Utc::now(),
            )
            .await?;
            if let Some(funding) = &order.transactions.btc_funding {
                println!("💰 HTLC funded: {}:{}", funding.txid, funding.vout);
                println!("Fee: {} sats", funding.fee);
            }
            print_summary(&order);
        }
        Commands::CreateEscrow { order } => {
            let client = escrow_client(&settings)?;
            let order = steps::create_escrow(&store, &client, &order.order_id, Utc::now()).await?;
            if let Some(escrow) = &order.escrow {
                println!("🏦 Escrow address: {}", escrow.address);
                println!(
                    "Cancellation opens {}",
                    order
                        .timelocks
                        .evm
                        .cancellation_start()
                        .map(utils::time::format_unix)
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            print_summary(&order);
        }
        Commands::ClaimBtc {
            order,
            fees,
            destination,
        } => {
            let current = store.load(&order.order_id)?;
            let gateway = gateway_for(&settings, current.network)?;
            let key = btc_key(&settings, current.network)?;
            let fee_rate = pick_fee_rate(&gateway, &settings, &fees).await;
            let order = steps::claim_btc(
                &store,
                &gateway,
                &order.order_id,
                &key,
                &destination,
                fee_rate,
                Utc::now(),
            )
            .await?;
            if let Some(claim) = &order.transactions.btc_claim {
                println!("✅ HTLC claimed: {}", claim.txid);
            }
            print_summary(&order);
        }
        Commands::WithdrawEvm { order } => {
            let client = escrow_client(&settings)?;
            let order = steps::withdraw_evm(&store, &client, &order.order_id, Utc::now()).await?;
            if let Some(withdrawal) = &order.transactions.evm_withdraw {
                println!("✅ Escrow withdrawn: {}", withdrawal.txid);
            }
            print_summary(&order);
        }
        Commands::ExtractSecret { order, claim_txid } => {
            let current = store.load(&order.order_id)?;
            let gateway = gateway_for(&settings, current.network)?;
            let claim_txid = match claim_txid {
                Some(txid) => {
                    utils::txid::validate(&txid)?;
                    Some(Txid::from_str(&txid).context("invalid claim txid")?)
                }
                None => None,
            };
            let (order, secret) =
                steps::extract_secret(&store, &gateway, &order.order_id, claim_txid, Utc::now())
                    .await?;
            println!("🔑 Secret: {}", secret.to_hex());
            print_summary(&order);
        }
        Commands::RefundBtc {
            order,
            fees,
            destination,
        } => {
            let current = store.load(&order.order_id)?;
            let gateway = gateway_for(&settings, current.network)?;
            let key = btc_key(&settings, current.network)?;
            let fee_rate = pick_fee_rate(&gateway, &settings, &fees).await;
            let order = steps::refund_btc(
                &store,
                &gateway,
                &order.order_id,
                &key,
                &destination,
                fee_rate,
                Utc::now(),
            )
            .await?;
            if let Some(refund) = &order.transactions.btc_refund {
                println!("↩️  HTLC refunded: {}", refund.txid);
            }
            print_summary(&order);
        }
        Commands::CancelEvm { order } => {
            let client = escrow_client(&settings)?;
            let order = steps::cancel_evm(&store, &client, &order.order_id, Utc::now()).await?;
            if let Some(cancel) = &order.transactions.evm_cancel {
                println!("↩️  Escrow cancelled: {}", cancel.txid);
            }
            print_summary(&order);
        }
        Commands::ExpireOrder { order } => {
            let order = steps::expire_order(&store, &order.order_id, Utc::now())?;
            print_summary(&order);
        }
        Commands::ShowOrder { order, chain } => {
            let order = store.load(&order.order_id)?;
            print_summary(&order);
            print_details(&order);
            if chain {
                print_funding_status(&settings, &order).await?;
            }
        }
        Commands::ListOrders => {
            let orders = store.list()?;
            if orders.is_empty() {
                println!("No orders in {}", settings.orders_dir.display());
            }
            for order in &orders {
                println!(
                    "{:<38} {:<10} {:<11} {:>12} sats  {}",
                    order.order_id,
                    order.status.to_string(),
                    order.direction.to_string(),
                    order.amounts.btc_sats,
                    utils::time::format_timestamp(&order.created_at)
                );
            }
        }
        Commands::VerifyAddress { address, network } => {
            let network = match network {
                Some(name) => config::parse_network(&name)?,
                None => settings.network,
            };
            if !htlc::validate_address(&address, network) {
                bail!("{} is not a P2SH/P2WSH address for {}", address, network);
            }
            println!("✅ {} is a valid HTLC address for {}", address, network);
        }
    }

    Ok(())
}

/// Gateway for the order's network, honouring URL overrides for the configured network
fn gateway_for(settings: &SwapSettings, network: Network) -> Result<EsploraGateway> {
    let (primary, fallback) = if network == settings.network {
        (settings.api_base.clone(), settings.fallback_api_base.clone())
    } else {
        log::warn!(
            "Order network {} differs from {}={}; using default endpoints",
            network,
            config::env::BTC_NETWORK,
            settings.network
        );
        config::api_bases(network)
    };
    Ok(EsploraGateway::new(&primary, fallback.as_deref())?)
}

fn btc_key(settings: &SwapSettings, network: Network) -> Result<PrivateKey> {
    let key = PrivateKey::from_wif(settings.require_btc_key()?.trim())
        .with_context(|| format!("{} is not a valid WIF key", config::env::BTC_PRIVATE_KEY))?;
    if key.network != bitcoin::NetworkKind::from(network) {
        bail!("{} is not a key for {}", config::env::BTC_PRIVATE_KEY, network);
    }
    Ok(key)
}

fn escrow_client(settings: &SwapSettings) -> Result<AlloyEscrowClient> {
    let (rpc_url, private_key, factory) = settings.require_evm()?;
    Ok(AlloyEscrowClient::connect(rpc_url, private_key, factory)?)
}

async fn pick_fee_rate<G: ChainGateway>(gateway: &G, settings: &SwapSettings, fees: &FeeArgs) -> f64 {
    resolve_fee_rate(gateway, fees.fee_rate.or(settings.fee_rate), fees.fee_priority).await
}

fn print_summary(order: &Order) {
    println!("\n📋 Order {}", order.order_id);
    println!("Status:    {}", order.status);
    println!("Direction: {}", order.direction);
    println!(
        "Amounts:   {} / {} wei",
        utils::amount::format_dual(order.amounts.btc_sats),
        utils::amount::format_wei(order.amounts.evm_amount)
    );
}

fn print_details(order: &Order) {
    println!("Hashlock:  {}", order.hashlock);
    println!("Network:   {}", order.network);
    println!("Maker:     {} / {}", order.maker.evm_address, order.maker.btc_pubkey);
    if let Some(taker) = &order.taker {
        println!("Taker:     {} / {}", taker.evm_address, taker.btc_pubkey);
    }
    if let Some(htlc) = &order.htlc {
        println!("HTLC:      {} ({:?}, locktime {})", htlc.address, htlc.kind, htlc.locktime);
    }
    if let Some(escrow) = &order.escrow {
        println!("Escrow:    {} ({:?})", escrow.address, escrow.side);
    }

    let refs = &order.transactions;
    let entries = [
        ("BTC funding", refs.btc_funding.as_ref().map(|f| f.txid.clone())),
        ("BTC claim", refs.btc_claim.as_ref().map(|t| t.txid.clone())),
        ("BTC refund", refs.btc_refund.as_ref().map(|t| t.txid.clone())),
        ("EVM escrow", refs.evm_escrow.as_ref().map(|t| t.txid.clone())),
        ("EVM withdraw", refs.evm_withdraw.as_ref().map(|t| t.txid.clone())),
        ("EVM cancel", refs.evm_cancel.as_ref().map(|t| t.txid.clone())),
    ];
    for (label, txid) in entries {
        if let Some(txid) = txid {
            println!("{:<13}{}", format!("{}:", label), utils::txid::format_short(&txid));
        }
    }

    println!("\nHistory:");
    for change in &order.history {
        println!(
            "  {} {} -> {} ({})",
            utils::time::format_timestamp(&change.at),
            change.from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            change.to,
            change.note
        );
    }
}

async fn print_funding_status(settings: &SwapSettings, order: &Order) -> Result<()> {
    let Some(funding) = &order.transactions.btc_funding else {
        println!("HTLC not funded yet");
        return Ok(());
    };
    let gateway = gateway_for(settings, order.network)?;
    let txid = Txid::from_str(&funding.txid).context("invalid funding txid")?;
    let status = gateway.get_tx_status(&txid).await?;
    match status.block_height {
        Some(height) if status.confirmed => println!("Funding confirmed at height {}", height),
        _ => println!("Funding unconfirmed"),
    }
    Ok(())
}
