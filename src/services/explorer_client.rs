//! # Bitcoin Chain Gateway
//!
//! [`ChainGateway`] is the capability the swap steps need from a Bitcoin
//! node: UTXO lookup, transaction fetch, broadcast, fee estimation and the
//! chain tip. [`EsploraGateway`] implements it over the Esplora HTTP API
//! served by mempool.space and blockstream.info.
//!
//! Every request is retried with backoff on transient failures, then
//! repeated against the fallback base URL. Client errors (4xx) are returned
//! at once: a rejected broadcast will not succeed elsewhere.

use crate::config::fees::DEFAULT_FEE_RATE;
use crate::config::network::REQUEST_TIMEOUT;
use crate::error::{NetworkError, NetworkResult, SwapError, SwapResult};
use crate::transactions::Utxo;
use crate::utils::retry;
use async_trait::async_trait;
use bitcoin::{consensus::encode::deserialize_hex, Address, OutPoint, Transaction, Txid};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;

/// Confirmation status of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_time: Option<u64>,
}

/// Fee rates in sat/vB, as returned by `/v1/fees/recommended`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedFees {
    pub fastest_fee: f64,
    pub half_hour_fee: f64,
    pub hour_fee: f64,
    pub economy_fee: f64,
    pub minimum_fee: f64,
}

impl RecommendedFees {
    /// Map Esplora `/fee-estimates` (confirmation target in blocks to rate)
    pub fn from_estimates(estimates: &HashMap<String, f64>) -> Option<Self> {
        let at = |target: &str| estimates.get(target).copied();
        let fastest = at("1")?;
        let half_hour = at("3").unwrap_or(fastest);
        let hour = at("6").unwrap_or(half_hour);
        let economy = at("144").unwrap_or(hour);
        let minimum = at("1008").unwrap_or(economy);
        Some(Self {
            fastest_fee: fastest,
            half_hour_fee: half_hour,
            hour_fee: hour,
            economy_fee: economy,
            minimum_fee: minimum,
        })
    }

    pub fn rate(&self, priority: FeePriority) -> f64 {
        match priority {
            FeePriority::Fastest => self.fastest_fee,
            FeePriority::HalfHour => self.half_hour_fee,
            FeePriority::Hour => self.hour_fee,
            FeePriority::Economy => self.economy_fee,
            FeePriority::Minimum => self.minimum_fee,
        }
    }
}

/// Which recommended rate to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeePriority {
    Fastest,
    #[default]
    HalfHour,
    Hour,
    Economy,
    Minimum,
}

impl FromStr for FeePriority {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fastest" => Ok(FeePriority::Fastest),
            "half-hour" | "halfhour" => Ok(FeePriority::HalfHour),
            "hour" => Ok(FeePriority::Hour),
            "economy" => Ok(FeePriority::Economy),
            "minimum" => Ok(FeePriority::Minimum),
            other => Err(SwapError::config(format!("Unknown fee priority: {}", other))),
        }
    }
}

/// Bitcoin network access used by the swap steps
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Unspent outputs of an address
    async fn get_utxos(&self, address: &Address) -> SwapResult<Vec<Utxo>>;

    async fn get_transaction(&self, txid: &Txid) -> SwapResult<Transaction>;

    async fn get_tx_status(&self, txid: &Txid) -> SwapResult<TxStatus>;

    /// Transaction spending `outpoint`, if any
    async fn get_spending_txid(&self, outpoint: &OutPoint) -> SwapResult<Option<Txid>>;

    /// Submit a raw transaction, returning the txid reported by the node
    async fn broadcast(&self, raw_hex: &str) -> SwapResult<Txid>;

    async fn fee_rates(&self) -> SwapResult<RecommendedFees>;

    async fn tip_height(&self) -> SwapResult<u32>;
}

/// Pick the fee rate for a step.
///
/// An explicit rate wins. Otherwise the gateway's recommendation for
/// `priority` is used, and if that fails the default rate.
pub async fn resolve_fee_rate<G: ChainGateway + ?Sized>(
    gateway: &G,
    explicit: Option<f64>,
    priority: FeePriority,
) -> f64 {
    if let Some(rate) = explicit {
        return rate;
    }
    match gateway.fee_rates().await {
        Ok(fees) => {
            let rate = fees.rate(priority);
            log::info!("Using recommended fee rate {} sat/vB ({:?})", rate, priority);
            rate
        }
        Err(e) => {
            log::warn!(
                "Fee estimation failed, using default {} sat/vB: {}",
                DEFAULT_FEE_RATE,
                e
            );
            DEFAULT_FEE_RATE
        }
    }
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraOutspend {
    spent: bool,
    txid: Option<String>,
}

/// Esplora HTTP client with a fallback transport
#[derive(Debug, Clone)]
pub struct EsploraGateway {
    client: Client,
    primary: String,
    fallback: Option<String>,
}

impl EsploraGateway {
    /// Create a gateway for a primary base URL and an optional fallback
    pub fn new(primary: &str, fallback: Option<&str>) -> SwapResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SwapError::config(format!("HTTP client creation failed: {}", e)))?;

        Ok(Self {
            client,
            primary: primary.trim_end_matches('/').to_string(),
            fallback: fallback.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    fn bases(&self) -> Vec<String> {
        let mut bases = vec![self.primary.clone()];
        bases.extend(self.fallback.clone());
        bases
    }

    /// Run `call` against each base URL in turn, with retries on each
    async fn with_fallback<T, F, Fut>(&self, operation: &str, call: F) -> NetworkResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = NetworkResult<T>>,
    {
        let mut attempts = 0u32;
        let mut last_error = String::new();

        for base in self.bases() {
            let result = retry::with_backoff(
                operation,
                |e: &NetworkError| e.is_transient(),
                || {
                    attempts += 1;
                    call(base.clone())
                },
            )
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    log::warn!("{} via {} failed: {}", operation, base, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(NetworkError::Exhausted {
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }

    async fn get(&self, url: String) -> NetworkResult<Response> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| NetworkError::Request {
                url: url.clone(),
                source,
            })?;
        ensure_success(url, response).await
    }

    async fn get_text(&self, url: String) -> NetworkResult<String> {
        let response = self.get(url.clone()).await?;
        response
            .text()
            .await
            .map_err(|source| NetworkError::Request { url, source })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> NetworkResult<T> {
        let response = self.get(url.clone()).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| NetworkError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }

    async fn post_text(&self, url: String, body: String) -> NetworkResult<String> {
        let response = self
            .client
            .post(&url)
            .body(body)
            .send()
            .await
            .map_err(|source| NetworkError::Request {
                url: url.clone(),
                source,
            })?;
        let response = ensure_success(url.clone(), response).await?;
        response
            .text()
            .await
            .map_err(|source| NetworkError::Request { url, source })
    }

    async fn fee_rates_at(&self, base: String) -> NetworkResult<RecommendedFees> {
        match self
            .get_json::<RecommendedFees>(format!("{}/v1/fees/recommended", base))
            .await
        {
            Ok(fees) => Ok(fees),
            Err(NetworkError::HttpError { status: 404, .. }) => {
                let url = format!("{}/fee-estimates", base);
                let estimates: HashMap<String, f64> = self.get_json(url.clone()).await?;
                RecommendedFees::from_estimates(&estimates).ok_or(NetworkError::InvalidResponse {
                    url,
                    message: "no next-block estimate".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

async fn ensure_success(url: String, response: Response) -> NetworkResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(NetworkError::HttpError {
        url,
        status: status.as_u16(),
        message,
    })
}

fn parse_txid(url: &str, value: &str) -> NetworkResult<Txid> {
    Txid::from_str(value.trim()).map_err(|e| NetworkError::InvalidResponse {
        url: url.to_string(),
        message: format!("invalid txid {}: {}", value.trim(), e),
    })
}

#[async_trait]
impl ChainGateway for EsploraGateway {
    async fn get_utxos(&self, address: &Address) -> SwapResult<Vec<Utxo>> {
        let raw: Vec<EsploraUtxo> = self
            .with_fallback("UTXO lookup", |base| {
                self.get_json(format!("{}/address/{}/utxo", base, address))
            })
            .await?;

        let script_pubkey = address.script_pubkey();
        let utxos = raw
            .into_iter()
            .map(|utxo| {
                Ok(Utxo {
                    txid: parse_txid("utxo", &utxo.txid)?,
                    vout: utxo.vout,
                    value: utxo.value,
                    script_pubkey: script_pubkey.clone(),
                    address: address.to_string(),
                })
            })
            .collect::<NetworkResult<Vec<_>>>()?;
        log::debug!("Found {} UTXOs for {}", utxos.len(), address);
        Ok(utxos)
    }

    async fn get_transaction(&self, txid: &Txid) -> SwapResult<Transaction> {
        let raw = self
            .with_fallback("transaction fetch", |base| {
                self.get_text(format!("{}/tx/{}/hex", base, txid))
            })
            .await?;
        deserialize_hex::<Transaction>(raw.trim())
            .map_err(|e| SwapError::transaction(format!("Undecodable transaction {}: {}", txid, e)))
    }

    async fn get_tx_status(&self, txid: &Txid) -> SwapResult<TxStatus> {
        let tx: EsploraTx = self
            .with_fallback("transaction status", |base| {
                self.get_json(format!("{}/tx/{}", base, txid))
            })
            .await?;
        Ok(tx.status)
    }

    async fn get_spending_txid(&self, outpoint: &OutPoint) -> SwapResult<Option<Txid>> {
        let url_of = |base: &str| format!("{}/tx/{}/outspend/{}", base, outpoint.txid, outpoint.vout);
        let outspend: EsploraOutspend = self
            .with_fallback("outspend lookup", |base| self.get_json(url_of(&base)))
            .await?;
        match (outspend.spent, outspend.txid) {
            (true, Some(txid)) => Ok(Some(parse_txid("outspend", &txid)?)),
            _ => Ok(None),
        }
    }

    async fn broadcast(&self, raw_hex: &str) -> SwapResult<Txid> {
        let body = self
            .with_fallback("broadcast", |base| {
                self.post_text(format!("{}/tx", base), raw_hex.to_string())
            })
            .await?;
        let txid = parse_txid("broadcast", &body)?;
        log::info!("Broadcast transaction {}", txid);
        Ok(txid)
    }

    async fn fee_rates(&self) -> SwapResult<RecommendedFees> {
        Ok(self
            .with_fallback("fee estimation", |base| self.fee_rates_at(base))
            .await?)
    }

    async fn tip_height(&self) -> SwapResult<u32> {
        let text = self
            .with_fallback("tip height", |base| {
                self.get_text(format!("{}/blocks/tip/height", base))
            })
            .await?;
        text.trim().parse::<u32>().map_err(|_| {
            SwapError::from(NetworkError::InvalidResponse {
                url: "blocks/tip/height".to_string(),
                message: format!("not a block height: {}", text.trim()),
            })
        })
    }
}
