use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockId, BlockNumber, Bytes, H256, U256, U64};

use super::ChainProvider;
use crate::error::ProviderError;
use crate::ledger::{TxParams, TxReceipt};

/// `ChainProvider` backed by an HTTP JSON-RPC endpoint
#[derive(Clone)]
pub struct EthersProvider {
    provider: Provider<Http>,
}

impl EthersProvider {
    pub fn new(rpc_url: &str) -> Result<Self, ProviderError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ProviderError::new(format!("Invalid RPC url {}: {}", rpc_url, e)))?;
        Ok(Self { provider })
    }

    pub async fn chain_id(&self) -> Result<u64, ProviderError> {
        self.provider
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| ProviderError::new(e.to_string()))
    }

    pub async fn block_number(&self) -> Result<u64, ProviderError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ProviderError::new(e.to_string()))
    }

    /// Hashes of the transactions included in block `number`, or `None` if
    /// the node does not have it yet.
    pub async fn block_tx_hashes(&self, number: u64) -> Result<Option<Vec<H256>>, ProviderError> {
        self.provider
            .get_block(BlockId::Number(BlockNumber::Number(U64::from(number))))
            .await
            .map(|block| block.map(|b| b.transactions))
            .map_err(|e| ProviderError::new(e.to_string()))
    }
}

#[async_trait]
impl ChainProvider for EthersProvider {
    async fn next_nonce(&self, address: Address) -> Result<u64, ProviderError> {
        let count = self
            .provider
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map_err(|e| ProviderError::new(e.to_string()))?;
        Ok(count.as_u64())
    }

    async fn gas_price(&self) -> Result<U256, ProviderError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ProviderError::new(e.to_string()))
    }

    async fn estimate_gas(&self, params: &TxParams) -> Result<U256, ProviderError> {
        self.provider
            .estimate_gas(&params.typed_transaction(), None)
            .await
            .map_err(|e| ProviderError::new(e.to_string()))
    }

    async fn publish(&self, raw: &Bytes) -> Result<H256, ProviderError> {
        let pending = self
            .provider
            .send_raw_transaction(raw.clone())
            .await
            .map_err(|e| ProviderError::new(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TxReceipt>, ProviderError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ProviderError::new(e.to_string()))?;

        Ok(receipt.map(|r| TxReceipt {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number.map(|n| n.as_u64()),
            gas_used: r.gas_used,
            success: r.status == Some(U64::from(1)),
        }))
    }
}
