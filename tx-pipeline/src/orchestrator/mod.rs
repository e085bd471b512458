//! Transaction orchestrator
//!
//! Public entry point of the pipeline. Accepts requests, applies defaults,
//! and drives records through approve, sign and publish. Confirmation and
//! drop detection belong to the pending monitor.

mod replace;

pub use replace::{CANCEL_GAS_LIMIT, bump};

use ethers::types::{Address, H256, U256};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, RecordedError, Result, TxPipelineError};
use crate::ledger::{
    LedgerStore, TransactionRecord, TxFilter, TxId, TxKind, TxParams, TxRequest, TxStatus,
};
use crate::nonce::{NonceAllocator, NonceLock};
use crate::rpc::ChainProvider;
use crate::wallet::TxSigner;

fn ensure_unapproved(record: &TransactionRecord) -> Result<()> {
    if record.status == TxStatus::Unapproved {
        Ok(())
    } else {
        Err(TxPipelineError::InvalidTransition {
            id: record.id,
            from: record.status,
            to: TxStatus::Unapproved,
        })
    }
}

pub struct TxOrchestrator {
    store: Arc<LedgerStore>,
    allocator: Arc<NonceAllocator>,
    provider: Arc<dyn ChainProvider>,
    signer: Arc<dyn TxSigner>,
    config: PipelineConfig,
}

impl TxOrchestrator {
    pub fn new(
        store: Arc<LedgerStore>,
        allocator: Arc<NonceAllocator>,
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn TxSigner>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            allocator,
            provider,
            signer,
            config,
        }
    }

    /// Validate a request and fill in defaults, without touching the store.
    fn normalize(&self, request: &TxRequest) -> Result<TxParams> {
        let from = request
            .from
            .ok_or_else(|| TxPipelineError::Validation("missing 'from' address".to_string()))?;
        if !self.signer.accounts().contains(&from) {
            return Err(TxPipelineError::Validation(format!(
                "unknown account {:?}",
                from
            )));
        }

        let has_data = request.data.as_ref().is_some_and(|d| !d.is_empty());
        if request.to.is_none() && !has_data {
            return Err(TxPipelineError::Validation(
                "either 'to' or 'data' must be provided".to_string(),
            ));
        }

        let chain_id = request.chain_id.unwrap_or(self.config.default_chain_id);
        if chain_id == 0 {
            return Err(TxPipelineError::Validation("chain id must be non-zero".to_string()));
        }

        if request.gas_price.is_some()
            && (request.max_fee_per_gas.is_some() || request.max_priority_fee_per_gas.is_some())
        {
            return Err(TxPipelineError::Validation(
                "cannot mix 'gas_price' with EIP-1559 fee fields".to_string(),
            ));
        }
        if request.max_priority_fee_per_gas.is_some() && request.max_fee_per_gas.is_none() {
            return Err(TxPipelineError::Validation(
                "'max_priority_fee_per_gas' requires 'max_fee_per_gas'".to_string(),
            ));
        }

        Ok(TxParams {
            from,
            to: request.to,
            value: request.value.unwrap_or_default(),
            gas: request
                .gas
                .unwrap_or_else(|| U256::from(self.config.default_gas_limit)),
            gas_price: request.gas_price,
            max_fee_per_gas: request.max_fee_per_gas,
            max_priority_fee_per_gas: request.max_priority_fee_per_gas,
            nonce: None,
            chain_id,
            data: request.data.clone().filter(|d| !d.is_empty()),
        })
    }

    /// Gas price and gas limit to fill in, if missing.
    ///
    /// The price is fetched when no fee field is set. The limit is estimated
    /// for calls carrying data whose request had no explicit gas; plain
    /// transfers keep the default limit.
    async fn gas_defaults(&self, params: &TxParams, explicit_gas: bool) -> Result<(Option<U256>, Option<U256>)> {
        let gas_price = if params.fee_cap().is_none() {
            let price = self.provider.gas_price().await.map_err(|e| {
                TxPipelineError::Validation(format!("failed to fetch gas price: {}", e))
            })?;
            Some(price)
        } else {
            None
        };

        let gas_limit = if !explicit_gas && params.data.is_some() {
            let estimate = self.provider.estimate_gas(params).await.map_err(|e| {
                TxPipelineError::Validation(format!("failed to estimate gas: {}", e))
            })?;
            Some(estimate)
        } else {
            None
        };

        Ok((gas_price, gas_limit))
    }

    /// Create an `unapproved` record from a request.
    ///
    /// Missing gas values are filled from the provider. If a lookup fails
    /// the record is kept as `failed` and the error returned.
    pub async fn submit(&self, request: TxRequest) -> Result<TransactionRecord> {
        let params = self.normalize(&request)?;
        let mut record = self.store.add(TransactionRecord::new(params))?;

        log::info!(
            "[Orchestrator] Queued transaction {} from {:?} on chain {}",
            record.id,
            record.from(),
            record.params.chain_id
        );

        let (gas_price, gas_limit) = match self.gas_defaults(&record.params, request.gas.is_some()).await {
            Ok(defaults) => defaults,
            Err(e) => {
                self.fail(record.id, &e);
                return Err(e);
            }
        };

        if let Some(gas_price) = gas_price {
            record = self.store.update(record.id, "Default gas price added", |r| {
                r.params.gas_price = Some(gas_price);
                Ok(())
            })?;
        }
        if let Some(gas) = gas_limit {
            record = self.store.update(record.id, "Estimated gas limit added", |r| {
                r.params.gas = gas;
                Ok(())
            })?;
        }
        Ok(record)
    }

    /// Replace the params of an `unapproved` record.
    ///
    /// The request is validated and defaulted as in `submit`; the sender
    /// cannot change. On any error the record is left as it was.
    pub async fn update_params(&self, id: TxId, request: TxRequest) -> Result<TransactionRecord> {
        let current = self.store.get(id).ok_or(TxPipelineError::NotFound(id))?;
        ensure_unapproved(&current)?;

        let mut request = request;
        if *request.from.get_or_insert(current.from()) != current.from() {
            return Err(TxPipelineError::Validation(
                "cannot change the sender of a transaction".to_string(),
            ));
        }

        let mut params = self.normalize(&request)?;
        let (gas_price, gas_limit) = self.gas_defaults(&params, request.gas.is_some()).await?;
        if gas_price.is_some() {
            params.gas_price = gas_price;
        }
        if let Some(gas) = gas_limit {
            params.gas = gas;
        }

        let updated = self.store.update(id, "Transaction params updated", |r| {
            ensure_unapproved(r)?;
            r.params = params;
            Ok(())
        })?;
        log::info!("[Orchestrator] Updated params of transaction {}", id);
        Ok(updated)
    }

    /// `update_params` followed by `approve`.
    pub async fn update_and_approve(&self, id: TxId, request: TxRequest) -> Result<TransactionRecord> {
        self.update_params(id, request).await?;
        self.approve(id).await
    }

    /// Submit, then wait until the record is broadcast or finalized.
    ///
    /// Resolves with the hash once `submitted`. A cancelled record yields
    /// `UserRejected`; any other terminal outcome yields `Failed` with the
    /// recorded message.
    pub async fn request_and_await(&self, request: TxRequest) -> Result<H256> {
        let record = self.submit(request).await?;
        self.await_settlement(record.id).await
    }

    pub async fn await_settlement(&self, id: TxId) -> Result<H256> {
        let settled = self
            .store
            .settled(id)?
            .await
            .map_err(|_| TxPipelineError::NotFound(id))?;

        match settled.status {
            TxStatus::Submitted | TxStatus::Confirmed => settled.hash.ok_or_else(|| TxPipelineError::Failed {
                id,
                kind: ErrorKind::Publish,
                message: "transaction has no hash".to_string(),
            }),
            TxStatus::Rejected => Err(TxPipelineError::UserRejected),
            _ => {
                let error = settled.error.unwrap_or_else(|| {
                    RecordedError::new(ErrorKind::Publish, format!("transaction ended as {}", settled.status))
                });
                Err(TxPipelineError::Failed {
                    id,
                    kind: error.kind,
                    message: error.message,
                })
            }
        }
    }

    /// Approve, sign and publish a record.
    ///
    /// The nonce lock is released on every path, after the record has left
    /// `approved`/`signed`, so the next allocation never sees a stale
    /// in-flight nonce.
    pub async fn approve(&self, id: TxId) -> Result<TransactionRecord> {
        let record = self.store.set_status(id, TxStatus::Approved, "Transaction approved")?;
        log::info!("[Orchestrator] Approved transaction {}", id);

        if !self.signer.accounts().contains(&record.from()) {
            let error = TxPipelineError::Validation(format!("unknown account {:?}", record.from()));
            self.fail(id, &error);
            return Err(error);
        }

        let lock = match self.allocator.acquire(record.from()).await {
            Ok(lock) => lock,
            Err(e) => {
                self.fail(id, &e);
                return Err(e);
            }
        };

        let outcome = self.sign_and_publish(&record, &lock).await;
        if let Err(e) = &outcome {
            log::warn!("[Orchestrator] Transaction {} failed: {}", id, e);
            self.fail(id, e);
        }
        lock.release();
        outcome
    }

    async fn sign_and_publish(&self, record: &TransactionRecord, lock: &NonceLock) -> Result<TransactionRecord> {
        let id = record.id;
        let nonce = record
            .replacement
            .map(|r| r.nonce)
            .unwrap_or_else(|| lock.next_nonce());

        let mut nonce_details = lock.nonce_details().clone();
        nonce_details.allocated = nonce;
        self.store.update(id, "Nonce locked", |r| {
            r.nonce_details = Some(nonce_details);
            Ok(())
        })?;

        let mut params = record.params.clone();
        params.nonce = Some(nonce);
        let raw = self.signer.sign(&params).await.map_err(TxPipelineError::Sign)?;

        self.store.update(id, "Transaction signed", |r| {
            if r.params.nonce.is_some_and(|existing| existing != nonce) {
                return Err(TxPipelineError::Nonce {
                    address: format!("{:?}", r.from()),
                    message: format!("nonce already assigned to {}", id),
                });
            }
            r.params.nonce = Some(nonce);
            r.raw_signed = Some(raw.clone());
            r.status = TxStatus::Signed;
            Ok(())
        })?;

        let hash = self
            .provider
            .publish(&raw)
            .await
            .map_err(|e| TxPipelineError::Publish(e.message))?;

        let submitted = self.store.update(id, "Transaction submitted", |r| {
            r.hash = Some(hash);
            r.submitted_at = Some(chrono::Utc::now());
            r.status = TxStatus::Submitted;
            Ok(())
        })?;

        log::info!(
            "[Orchestrator] Transaction {} submitted as {:?} (nonce {})",
            id,
            hash,
            nonce
        );
        Ok(submitted)
    }

    fn fail(&self, id: TxId, error: &TxPipelineError) {
        let recorded = error.to_recorded();
        if let Err(e) = self.store.update(id, "Transaction failed", |r| {
            r.status = TxStatus::Failed;
            r.error = Some(recorded);
            Ok(())
        }) {
            log::warn!("[Orchestrator] Could not mark {} as failed: {}", id, e);
        }
    }

    /// Reject an `unapproved` record.
    pub fn cancel(&self, id: TxId) -> Result<TransactionRecord> {
        let record = self.store.set_status(id, TxStatus::Rejected, "User rejected transaction")?;
        log::info!("[Orchestrator] Transaction {} rejected", id);
        Ok(record)
    }

    fn replaceable(&self, id: TxId) -> Result<(TransactionRecord, u64)> {
        let original = self.store.get(id).ok_or(TxPipelineError::NotFound(id))?;
        if original.status != TxStatus::Submitted {
            return Err(TxPipelineError::Validation(format!(
                "transaction {} is {}, only submitted transactions can be replaced",
                id, original.status
            )));
        }
        let nonce = original.nonce().ok_or_else(|| {
            TxPipelineError::Validation(format!("transaction {} has no nonce", id))
        })?;
        Ok((original, nonce))
    }

    async fn replace(&self, original: &TransactionRecord, kind: TxKind, nonce: u64, params: TxParams) -> Result<TransactionRecord> {
        let record = self
            .store
            .add(TransactionRecord::replacing(original, kind, nonce, params))?;
        log::info!(
            "[Orchestrator] Created {} {} for {} (nonce {})",
            kind,
            record.id,
            original.id,
            nonce
        );
        self.approve(record.id).await
    }

    /// Re-send a submitted transaction's call with at least 10% higher fees.
    /// The original record is left untouched.
    pub async fn speed_up(&self, id: TxId, gas_price: Option<U256>) -> Result<TransactionRecord> {
        let (original, nonce) = self.replaceable(id)?;
        let params = replace::speed_up_params(&original.params, gas_price);
        self.replace(&original, TxKind::SpeedUp, nonce, params).await
    }

    /// Compete for a submitted transaction's nonce with a zero-value
    /// self-transfer at higher fees.
    pub async fn cancel_submitted(&self, id: TxId, gas_price: Option<U256>) -> Result<TransactionRecord> {
        let (original, nonce) = self.replaceable(id)?;
        let params = replace::cancel_params(&original.params, gas_price);
        self.replace(&original, TxKind::Cancel, nonce, params).await
    }

    /// Fail records left `approved` or `signed`, e.g. after restoring a
    /// snapshot. Call before any approval is in flight.
    pub fn recover_interrupted(&self) -> Vec<TxId> {
        let filter = TxFilter::new().statuses(&[TxStatus::Approved, TxStatus::Signed]);
        let mut recovered = Vec::new();
        for record in self.store.query(&filter) {
            let error = RecordedError::new(
                ErrorKind::Interrupted,
                "Transaction was interrupted before being submitted",
            );
            let result = self.store.update(record.id, "Interrupted transaction failed", |r| {
                r.status = TxStatus::Failed;
                r.error = Some(error);
                Ok(())
            });
            if result.is_ok() {
                recovered.push(record.id);
            }
        }
        if !recovered.is_empty() {
            log::warn!("[Orchestrator] Failed {} interrupted transactions", recovered.len());
        }
        recovered
    }

    /// Forget every record sent by `address`, optionally on one chain only.
    pub fn wipe_transactions(&self, address: Address, chain_id: Option<u64>) -> Vec<TxId> {
        self.store.remove_by_sender(address, chain_id)
    }

    pub fn get(&self, id: TxId) -> Option<TransactionRecord> {
        self.store.get(id)
    }

    pub fn query(&self, filter: &TxFilter) -> std::vec::IntoIter<TransactionRecord> {
        self.store.query(filter)
    }

    /// Number of broadcast, unconfirmed transactions from `address`
    pub fn pending_count(&self, address: Address) -> usize {
        self.store
            .query(&TxFilter::new().from(address).status(TxStatus::Submitted))
            .count()
    }

    pub fn unapproved(&self) -> Vec<TransactionRecord> {
        self.store
            .query(&TxFilter::new().status(TxStatus::Unapproved))
            .collect()
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }
}
