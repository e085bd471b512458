//! Transaction submission and confirmation pipeline
//!
//! Moves signed value transfers from request to finalization on an
//! account-based chain: per-sender nonce allocation, a status state machine
//! over an in-memory ledger, and reconciliation of broadcast transactions
//! against new blocks.

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod monitor;
pub mod nonce;
pub mod orchestrator;
pub mod rpc;
pub mod wallet;

#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use config::PipelineConfig;
pub use error::{ErrorKind, ProviderError, RecordedError, Result, TxPipelineError};
pub use events::{EventBroadcaster, StateEvent};
pub use ledger::{LedgerStore, TransactionRecord, TxFilter, TxId, TxRequest, TxStatus};
pub use monitor::{MonitorReport, PendingTxMonitor, ResubmitPolicy};
pub use nonce::{NonceAllocator, NonceLock};
pub use orchestrator::TxOrchestrator;
pub use rpc::{ChainEvent, ChainProvider};
pub use wallet::TxSigner;

/// The pipeline components wired to one store, provider and signer
pub struct TxPipeline {
    pub store: Arc<LedgerStore>,
    pub allocator: Arc<NonceAllocator>,
    pub monitor: Arc<PendingTxMonitor>,
    pub orchestrator: Arc<TxOrchestrator>,
}

impl TxPipeline {
    pub fn new(config: PipelineConfig, provider: Arc<dyn ChainProvider>, signer: Arc<dyn TxSigner>) -> Self {
        let store = Arc::new(LedgerStore::new(&config));
        Self::with_store(store, config, provider, signer)
    }

    /// Restore persisted records and fail any that were mid-approval.
    pub fn from_snapshot(
        records: Vec<TransactionRecord>,
        config: PipelineConfig,
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn TxSigner>,
    ) -> Result<Self> {
        let store = Arc::new(LedgerStore::from_snapshot(records, &config)?);
        let pipeline = Self::with_store(store, config, provider, signer);
        pipeline.orchestrator.recover_interrupted();
        Ok(pipeline)
    }

    fn with_store(
        store: Arc<LedgerStore>,
        config: PipelineConfig,
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn TxSigner>,
    ) -> Self {
        let allocator = Arc::new(NonceAllocator::new(store.clone(), provider.clone()));
        let monitor = Arc::new(PendingTxMonitor::new(
            store.clone(),
            provider.clone(),
            allocator.clone(),
            &config,
        ));
        let orchestrator = Arc::new(TxOrchestrator::new(
            store.clone(),
            allocator.clone(),
            provider,
            signer,
            config,
        ));

        log::info!("[Pipeline] Initialized with {} restored transactions", store.len());

        Self {
            store,
            allocator,
            monitor,
            orchestrator,
        }
    }
}
