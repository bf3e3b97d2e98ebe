//! EVM escrow contract calls.
//!
//! The factory stamps `deployedAt` with the creation block's timestamp, and
//! the escrow address is derived from the stamped immutables. Creation
//! therefore reads the block back and asks the factory for the address of
//! the final immutables.

use crate::error::{SwapError, SwapResult};
use crate::escrow::abi::{IEscrow, IEscrowFactory};
use crate::escrow::{parse_evm_address, EscrowImmutables};
use crate::orders::EscrowSide;
use crate::secret::Secret;
use alloy::eips::BlockNumberOrTag;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionReceipt;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

/// A created escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowDeployment {
    pub address: Address,
    pub tx_hash: String,
    /// Creation block timestamp, as stamped into the immutables
    pub deployed_at: u32,
}

/// EVM escrow operations used by the swap steps
#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Deploy the escrow for one side, funding it with the required value
    async fn create_escrow(
        &self,
        side: EscrowSide,
        immutables: &EscrowImmutables,
    ) -> SwapResult<EscrowDeployment>;

    /// Withdraw with the secret, returning the transaction hash
    async fn withdraw(
        &self,
        escrow: Address,
        secret: &Secret,
        immutables: &EscrowImmutables,
    ) -> SwapResult<String>;

    /// Cancel after the cancellation window opens, returning the transaction hash
    async fn cancel(&self, escrow: Address, immutables: &EscrowImmutables) -> SwapResult<String>;
}

/// [`EscrowClient`] over an alloy HTTP provider with a local signer
#[derive(Clone)]
pub struct AlloyEscrowClient {
    provider: DynProvider,
    factory: Address,
}

impl AlloyEscrowClient {
    pub fn connect(rpc_url: &str, private_key: &str, factory: &str) -> SwapResult<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| SwapError::crypto(format!("Invalid EVM private key: {}", e)))?;
        let url = rpc_url
            .parse()
            .map_err(|e| SwapError::config(format!("Invalid EVM RPC URL {}: {}", rpc_url, e)))?;
        let factory = parse_evm_address(factory)?;

        log::info!(
            "EVM signer {} using escrow factory {}",
            signer.address(),
            factory
        );
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url);

        Ok(Self {
            provider: DynProvider::new(provider),
            factory,
        })
    }

    async fn escrow_address(
        &self,
        side: EscrowSide,
        immutables: &EscrowImmutables,
    ) -> SwapResult<Address> {
        let factory = IEscrowFactory::new(self.factory, self.provider.clone());
        let call_args = immutables.into();
        let result = match side {
            EscrowSide::Src => factory.addressOfEscrowSrc(call_args).call().await,
            EscrowSide::Dst => factory.addressOfEscrowDst(call_args).call().await,
        };
        result.map_err(|e| SwapError::escrow("addressOfEscrow", e.to_string()))
    }

    async fn block_timestamp(&self, receipt: &TransactionReceipt) -> SwapResult<u32> {
        let number = receipt
            .block_number
            .ok_or_else(|| SwapError::escrow("create", "receipt has no block number"))?;
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(|e| SwapError::escrow("getBlock", e.to_string()))?
            .ok_or_else(|| SwapError::escrow("getBlock", format!("block {} not found", number)))?;
        u32::try_from(block.header.timestamp)
            .map_err(|_| SwapError::escrow("getBlock", "block timestamp exceeds u32"))
    }
}

fn ensure_succeeded(operation: &str, receipt: &TransactionReceipt) -> SwapResult<String> {
    let hash = receipt.transaction_hash.to_string();
    if !receipt.status() {
        return Err(SwapError::escrow(operation, format!("transaction {} reverted", hash)));
    }
    Ok(hash)
}

#[async_trait]
impl EscrowClient for AlloyEscrowClient {
    async fn create_escrow(
        &self,
        side: EscrowSide,
        immutables: &EscrowImmutables,
    ) -> SwapResult<EscrowDeployment> {
        let factory = IEscrowFactory::new(self.factory, self.provider.clone());
        let value = immutables.required_value();
        let call_args = immutables.into();
        log::info!("Creating {:?} escrow with value {} wei", side, value);

        let sent = match side {
            EscrowSide::Src => factory.createSrcEscrow(call_args).value(value).send().await,
            EscrowSide::Dst => factory.createDstEscrow(call_args).value(value).send().await,
        }
        .map_err(|e| SwapError::escrow("createEscrow", e.to_string()))?;
        let receipt = sent
            .get_receipt()
            .await
            .map_err(|e| SwapError::escrow("createEscrow", e.to_string()))?;
        let tx_hash = ensure_succeeded("createEscrow", &receipt)?;

        let deployed_at = self.block_timestamp(&receipt).await?;
        let stamped = EscrowImmutables {
            timelocks: immutables.timelocks.with_deployed_at(deployed_at),
            ..immutables.clone()
        };
        let address = self.escrow_address(side, &stamped).await?;
        log::info!("Escrow {} deployed at {} in {}", address, deployed_at, tx_hash);

        Ok(EscrowDeployment {
            address,
            tx_hash,
            deployed_at,
        })
    }

    async fn withdraw(
        &self,
        escrow: Address,
        secret: &Secret,
        immutables: &EscrowImmutables,
    ) -> SwapResult<String> {
        let contract = IEscrow::new(escrow, self.provider.clone());
        let receipt = contract
            .withdraw(B256::from(*secret.as_bytes()), immutables.into())
            .send()
            .await
            .map_err(|e| SwapError::escrow("withdraw", e.to_string()))?
            .get_receipt()
            .await
            .map_err(|e| SwapError::escrow("withdraw", e.to_string()))?;
        let tx_hash = ensure_succeeded("withdraw", &receipt)?;
        log::info!("Withdrew from escrow {} in {}", escrow, tx_hash);
        Ok(tx_hash)
    }

    async fn cancel(&self, escrow: Address, immutables: &EscrowImmutables) -> SwapResult<String> {
        let contract = IEscrow::new(escrow, self.provider.clone());
        let receipt = contract
            .cancel(immutables.into())
            .send()
            .await
            .map_err(|e| SwapError::escrow("cancel", e.to_string()))?
            .get_receipt()
            .await
            .map_err(|e| SwapError::escrow("cancel", e.to_string()))?;
        let tx_hash = ensure_succeeded("cancel", &receipt)?;
        log::info!("Cancelled escrow {} in {}", escrow, tx_hash);
        Ok(tx_hash)
    }
}
