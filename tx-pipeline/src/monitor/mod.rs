//! Pending transaction monitor
//!
//! Reconciles `submitted` records with the chain. Three triggers drive it:
//! - new block: confirm records whose hash the block includes
//! - latest: re-broadcast records that look lost, with block-based backoff
//! - sync: query receipts and detect nonces consumed by other transactions
//!
//! Every mutation is conditional on the record still being `submitted`, so
//! the monitor never touches records owned by the orchestrator and never
//! moves a terminal record.

mod policy;

pub use policy::{PublishErrorClass, ResubmitPolicy, classify_publish_error};

use dashmap::DashMap;
use ethers::types::H256;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, RecordedError, Result, TxPipelineError};
use crate::events::StateEvent;
use crate::ledger::{LedgerStore, TransactionRecord, TxFilter, TxId, TxReceipt, TxStatus, TxWarning};
use crate::nonce::NonceAllocator;
use crate::rpc::{ChainEvent, ChainProvider};

const RESUBMIT_WARNING: &str = "There was an error when resubmitting this transaction.";
const RECEIPT_WARNING: &str = "There was a problem loading this transaction.";

/// Records changed by one trigger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub confirmed: Vec<TxId>,
    pub failed: Vec<TxId>,
    pub dropped: Vec<TxId>,
    pub resubmitted: Vec<TxId>,
    pub warned: Vec<TxId>,
}

impl MonitorReport {
    fn merge(&mut self, other: MonitorReport) {
        self.confirmed.extend(other.confirmed);
        self.failed.extend(other.failed);
        self.dropped.extend(other.dropped);
        self.resubmitted.extend(other.resubmitted);
        self.warned.extend(other.warned);
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
            && self.failed.is_empty()
            && self.dropped.is_empty()
            && self.resubmitted.is_empty()
            && self.warned.is_empty()
    }
}

fn ensure_submitted(record: &TransactionRecord) -> Result<()> {
    if record.status == TxStatus::Submitted {
        Ok(())
    } else {
        Err(TxPipelineError::InvalidTransition {
            id: record.id,
            from: record.status,
            to: TxStatus::Submitted,
        })
    }
}

pub struct PendingTxMonitor {
    store: Arc<LedgerStore>,
    provider: Arc<dyn ChainProvider>,
    allocator: Arc<NonceAllocator>,
    policy: ResubmitPolicy,
    dropped_check_count: u32,
    /// Consecutive sync checks that saw the chain past a record's nonce
    dropped_checks: DashMap<TxId, u32>,
    started: AtomicBool,
}

impl PendingTxMonitor {
    pub fn new(
        store: Arc<LedgerStore>,
        provider: Arc<dyn ChainProvider>,
        allocator: Arc<NonceAllocator>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            allocator,
            policy: config.resubmit.clone(),
            dropped_check_count: config.dropped_check_count.max(1),
            dropped_checks: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Drive the monitor from a stream of chain events until cancelled.
    pub async fn run(&self, mut events: mpsc::Receiver<ChainEvent>, cancel: CancellationToken) {
        log::info!("[Monitor] Pending transaction monitor started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let report = match event {
                ChainEvent::NewBlock { number, tx_hashes } => self.on_new_block(number, &tx_hashes).await,
                ChainEvent::Latest { number } => self.on_latest(number).await,
                ChainEvent::Sync => self.on_sync().await,
            };

            if !report.is_empty() {
                log::debug!("[Monitor] {:?}", report);
            }
        }

        log::info!("[Monitor] Pending transaction monitor stopped");
    }

    fn pending(&self) -> Vec<TransactionRecord> {
        self.store.query(&TxFilter::new().status(TxStatus::Submitted)).collect()
    }

    /// Confirm every submitted record whose hash is in the block.
    ///
    /// The receipt is loaded from the provider and stored as returned; a
    /// failed lookup leaves it empty. The first block seen also runs a full
    /// sync.
    pub async fn on_new_block(&self, number: u64, tx_hashes: &[H256]) -> MonitorReport {
        let mut report = MonitorReport::default();
        let included: HashSet<H256> = tx_hashes.iter().copied().collect();

        for record in self.pending() {
            let Some(hash) = record.hash else { continue };
            if !included.contains(&hash) {
                continue;
            }
            let receipt = match self.provider.receipt(hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    log::warn!("[Monitor] Failed to load receipt for {}: {}", record.id, e);
                    None
                }
            };
            report.merge(self.confirm(&record, receipt));
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            log::info!("[Monitor] First block {} observed, running initial sync", number);
            report.merge(self.on_sync().await);
        }

        report
    }

    /// Re-broadcast submitted records that are due under the resubmit policy.
    pub async fn on_latest(&self, number: u64) -> MonitorReport {
        let mut report = MonitorReport::default();
        if !self.policy.enabled {
            return report;
        }

        for record in self.pending() {
            if record.first_retry_block.is_none() {
                let _ = self.store.update(record.id, "First retry block set", |r| {
                    ensure_submitted(r)?;
                    r.first_retry_block = Some(number);
                    Ok(())
                });
                continue;
            }
            if !self.policy.is_due(&record, number, chrono::Utc::now()) {
                continue;
            }
            report.merge(self.resubmit(&record).await);
        }

        report
    }

    async fn resubmit(&self, record: &TransactionRecord) -> MonitorReport {
        let mut report = MonitorReport::default();
        let Some(raw) = record.raw_signed.as_ref() else {
            log::warn!("[Monitor] Submitted transaction {} has no signed payload", record.id);
            return report;
        };

        log::info!("[Monitor] Resubmitting transaction {} (retry {})", record.id, record.retry_count + 1);

        match self.provider.publish(raw).await {
            Ok(_) => {
                let updated = self.store.update(record.id, "Retry count increased", |r| {
                    ensure_submitted(r)?;
                    r.retry_count += 1;
                    Ok(())
                });
                if updated.is_ok() {
                    report.resubmitted.push(record.id);
                }
            }
            Err(e) => match classify_publish_error(&e.message) {
                PublishErrorClass::Known => {
                    log::debug!("[Monitor] Ignoring known transaction error for {}: {}", record.id, e);
                }
                PublishErrorClass::NonceConsumed => {
                    report.merge(self.check_consumed_nonce(record, &e.message).await);
                }
                PublishErrorClass::Other => {
                    log::warn!("[Monitor] Resubmission of {} failed: {}", record.id, e);
                    if self.warn(record, &e.message, RESUBMIT_WARNING) {
                        report.warned.push(record.id);
                    }
                }
            },
        }

        report
    }

    /// The node says the nonce is used; settle the record from its own receipt.
    async fn check_consumed_nonce(&self, record: &TransactionRecord, error: &str) -> MonitorReport {
        let Some(hash) = record.hash else {
            return MonitorReport::default();
        };
        match self.provider.receipt(hash).await {
            Ok(Some(receipt)) => self.apply_receipt(record, receipt),
            Ok(None) => self.drop_record(record, None, &format!("Nonce already used: {}", error)),
            Err(e) => {
                let mut report = MonitorReport::default();
                if self.warn(record, &e.message, RECEIPT_WARNING) {
                    report.warned.push(record.id);
                }
                report
            }
        }
    }

    /// Query receipts for every submitted record while holding the global
    /// nonce lock.
    pub async fn on_sync(&self) -> MonitorReport {
        let _global = match self.allocator.global_lock().await {
            Ok(permit) => permit,
            Err(e) => {
                log::error!("[Monitor] Cannot take the global nonce lock: {}", e);
                return MonitorReport::default();
            }
        };
        let pending = self.pending();
        let mut report = MonitorReport::default();

        if !pending.is_empty() {
            log::debug!("[Monitor] Checking {} pending transactions", pending.len());
            let checks = pending.iter().map(|record| self.check(record));
            for outcome in futures_util::future::join_all(checks).await {
                report.merge(outcome);
            }
        }

        let live: HashSet<TxId> = self.pending().into_iter().map(|r| r.id).collect();
        self.dropped_checks.retain(|id, _| live.contains(id));
        self.allocator.prune_idle();

        report
    }

    async fn check(&self, record: &TransactionRecord) -> MonitorReport {
        let Some(hash) = record.hash else {
            let error = RecordedError::new(
                ErrorKind::Publish,
                "We had an error while submitting this transaction, please try again.",
            );
            return self.fail_record(record, error);
        };

        if let Some(winner) = self.nonce_taken_by(record) {
            log::info!("[Monitor] Nonce of {} already taken by {}", record.id, winner.id);
            return self.drop_record(record, winner.hash, "Nonce used by another confirmed transaction");
        }

        match self.provider.receipt(hash).await {
            Ok(Some(receipt)) => return self.apply_receipt(record, receipt),
            Ok(None) => {}
            Err(e) => {
                log::warn!("[Monitor] Failed to check transaction {}: {}", record.id, e);
                let mut report = MonitorReport::default();
                if self.warn(record, &e.message, RECEIPT_WARNING) {
                    report.warned.push(record.id);
                }
                return report;
            }
        }

        if self.is_dropped(record).await {
            return self.drop_record(record, None, "Nonce consumed without a receipt for this transaction");
        }
        MonitorReport::default()
    }

    /// Another confirmed local record from the same sender with the same nonce
    fn nonce_taken_by(&self, record: &TransactionRecord) -> Option<TransactionRecord> {
        let nonce = record.nonce()?;
        let filter = TxFilter::new()
            .from(record.from())
            .chain_id(record.params.chain_id)
            .nonce(nonce)
            .status(TxStatus::Confirmed);
        self.store.query(&filter).find(|r| r.id != record.id)
    }

    async fn is_dropped(&self, record: &TransactionRecord) -> bool {
        let Some(nonce) = record.nonce() else { return false };
        let network_next_nonce = match self.provider.next_nonce(record.from()).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("[Monitor] Failed to fetch nonce for {:?}: {}", record.from(), e);
                return false;
            }
        };

        if nonce >= network_next_nonce {
            self.dropped_checks.remove(&record.id);
            return false;
        }

        let mut count = self.dropped_checks.entry(record.id).or_insert(0);
        *count += 1;
        log::debug!(
            "[Monitor] Transaction {} nonce {} behind network {} ({}/{})",
            record.id,
            nonce,
            network_next_nonce,
            *count,
            self.dropped_check_count
        );
        *count >= self.dropped_check_count
    }

    fn apply_receipt(&self, record: &TransactionRecord, receipt: TxReceipt) -> MonitorReport {
        if receipt.success {
            self.confirm(record, Some(receipt))
        } else {
            let error = TxPipelineError::ReceiptFailure {
                id: record.id,
                reason: "execution reverted".to_string(),
            }
            .to_recorded();
            let id = record.id;
            let mut report = MonitorReport::default();
            let result = self.store.update(id, "Transaction receipt has failed status", |r| {
                ensure_submitted(r)?;
                r.status = TxStatus::Failed;
                r.receipt = Some(receipt);
                r.error = Some(error);
                Ok(())
            });
            if result.is_ok() {
                log::warn!("[Monitor] Transaction {} reverted", id);
                report.failed.push(id);
            }
            report
        }
    }

    fn confirm(&self, record: &TransactionRecord, receipt: Option<TxReceipt>) -> MonitorReport {
        let mut report = MonitorReport::default();
        let result = self.store.update(record.id, "Transaction confirmed", |r| {
            ensure_submitted(r)?;
            r.status = TxStatus::Confirmed;
            r.receipt = receipt.clone();
            r.warning = None;
            Ok(())
        });

        let Ok(confirmed) = result else {
            return report;
        };
        self.dropped_checks.remove(&confirmed.id);
        log::info!("[Monitor] Transaction {} confirmed as {:?}", confirmed.id, confirmed.hash);
        report.confirmed.push(confirmed.id);

        if let Some(nonce) = confirmed.nonce() {
            let filter = TxFilter::new()
                .from(confirmed.from())
                .chain_id(confirmed.params.chain_id)
                .nonce(nonce)
                .status(TxStatus::Submitted);
            for duplicate in self.store.query(&filter).filter(|r| r.id != confirmed.id) {
                report.merge(self.drop_record(&duplicate, confirmed.hash, "Replaced by a confirmed transaction"));
            }
        }

        report
    }

    fn drop_record(&self, record: &TransactionRecord, replaced_by: Option<H256>, reason: &str) -> MonitorReport {
        let mut report = MonitorReport::default();
        let error = TxPipelineError::Dropped {
            id: record.id,
            reason: reason.to_string(),
        }
        .to_recorded();
        let result = self.store.update(record.id, "Transaction dropped", |r| {
            ensure_submitted(r)?;
            r.status = TxStatus::Dropped;
            r.replaced_by = replaced_by;
            r.error = Some(error);
            Ok(())
        });
        if result.is_ok() {
            self.dropped_checks.remove(&record.id);
            log::warn!("[Monitor] Transaction {} dropped: {}", record.id, reason);
            report.dropped.push(record.id);
        }
        report
    }

    fn fail_record(&self, record: &TransactionRecord, error: RecordedError) -> MonitorReport {
        let mut report = MonitorReport::default();
        let result = self.store.update(record.id, "Transaction failed", |r| {
            ensure_submitted(r)?;
            r.status = TxStatus::Failed;
            r.error = Some(error);
            Ok(())
        });
        if result.is_ok() {
            report.failed.push(record.id);
        }
        report
    }

    /// Attach a warning and notify subscribers. Status is left unchanged.
    fn warn(&self, record: &TransactionRecord, error: &str, message: &str) -> bool {
        let warning = TxWarning {
            error: error.to_string(),
            message: message.to_string(),
        };
        let result = self.store.update(record.id, "Warning added", |r| {
            ensure_submitted(r)?;
            r.warning = Some(warning.clone());
            Ok(())
        });
        if result.is_ok() {
            self.store.emit(StateEvent::Warning { id: record.id, warning });
            true
        } else {
            false
        }
    }
}
