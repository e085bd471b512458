//! Chain access
//!
//! `ChainProvider` is the only way the pipeline talks to a node. The host
//! supplies an implementation; `EthersProvider` wraps a JSON-RPC endpoint.

mod block_poller;
mod ethers_provider;

pub use block_poller::{BlockPoller, ChainEvent};
pub use ethers_provider::EthersProvider;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

use crate::error::ProviderError;
use crate::ledger::{TxParams, TxReceipt};

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Next nonce to use for `address`, counting pending transactions
    async fn next_nonce(&self, address: Address) -> Result<u64, ProviderError>;

    async fn gas_price(&self) -> Result<U256, ProviderError>;

    /// Gas limit the node expects `params` to need
    async fn estimate_gas(&self, params: &TxParams) -> Result<U256, ProviderError>;

    /// Broadcast a signed wire-encoded transaction
    async fn publish(&self, raw: &Bytes) -> Result<H256, ProviderError>;

    /// `None` while the transaction is not yet included
    async fn receipt(&self, hash: H256) -> Result<Option<TxReceipt>, ProviderError>;
}
