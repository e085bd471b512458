//! In-memory ledger of transaction records
//!
//! Thread-safe storage of records with a per-record change log. Every mutation
//! goes through `update`, which holds the record's map entry for the duration
//! of the mutator so concurrent writers to the same record are serialized.

use dashmap::DashMap;
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::history::{self, HistoryEntry};
use super::types::{TransactionRecord, TxId, TxStatus};
use crate::config::PipelineConfig;
use crate::error::{Result, TxPipelineError};
use crate::events::{EventBroadcaster, StateEvent};

/// Predicate over records used by `LedgerStore::query`
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub from: Option<Address>,
    pub statuses: Option<Vec<TxStatus>>,
    pub chain_id: Option<u64>,
    pub nonce: Option<u64>,
    pub hash: Option<H256>,
    pub exclude_errored: bool,
}

impl TxFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, address: Address) -> Self {
        self.from = Some(address);
        self
    }

    pub fn status(self, status: TxStatus) -> Self {
        self.statuses(&[status])
    }

    pub fn statuses(mut self, statuses: &[TxStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn hash(mut self, hash: H256) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn without_errors(mut self) -> Self {
        self.exclude_errored = true;
        self
    }

    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(from) = self.from {
            if record.params.from != from {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        if let Some(chain_id) = self.chain_id {
            if record.params.chain_id != chain_id {
                return false;
            }
        }
        if let Some(nonce) = self.nonce {
            if record.params.nonce != Some(nonce) {
                return false;
            }
        }
        if let Some(hash) = self.hash {
            if record.hash != Some(hash) {
                return false;
            }
        }
        !(self.exclude_errored && record.error.is_some())
    }
}

fn settles(status: TxStatus) -> bool {
    status == TxStatus::Submitted || status.is_terminal()
}

pub struct LedgerStore {
    /// Map of id -> record
    transactions: DashMap<TxId, TransactionRecord>,
    /// Insertion order, oldest first
    order: Mutex<Vec<TxId>>,
    /// One-shot waiters for the first settling status of a record
    settlements: DashMap<TxId, Vec<oneshot::Sender<TransactionRecord>>>,
    events: EventBroadcaster,
    retention_limit: usize,
}

impl LedgerStore {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            transactions: DashMap::new(),
            order: Mutex::new(Vec::new()),
            settlements: DashMap::new(),
            events: EventBroadcaster::new(config.event_channel_capacity),
            retention_limit: config.retention_limit.max(1),
        }
    }

    /// Restore a previously persisted set of records, oldest first.
    pub fn from_snapshot(records: Vec<TransactionRecord>, config: &PipelineConfig) -> Result<Self> {
        let store = Self::new(config);
        {
            let mut order = store.order.lock();
            for record in records {
                let id = record.id;
                if store.transactions.insert(id, record).is_some() {
                    return Err(TxPipelineError::DuplicateId(id));
                }
                order.push(id);
            }
        }
        log::info!("[Ledger] Restored {} transactions", store.len());
        store.prune();
        Ok(store)
    }

    /// Insert a new record. Fails if the id is already present.
    pub fn add(&self, record: TransactionRecord) -> Result<TransactionRecord> {
        let id = record.id;
        let from = record.params.from;
        {
            let mut order = self.order.lock();
            match self.transactions.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(TxPipelineError::DuplicateId(id));
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
            order.push(id);
        }
        log::info!("[Ledger] Added transaction {} from {:?}", id, from);
        self.events.broadcast(StateEvent::Added { id, from });
        self.prune();
        Ok(record)
    }

    pub fn get(&self, id: TxId) -> Option<TransactionRecord> {
        self.transactions.get(&id).map(|r| r.clone())
    }

    /// Apply `mutator` to the record and append one history entry.
    ///
    /// The mutator works on a copy; if it fails, or the resulting status is not
    /// a legal successor of the current one, nothing is committed.
    pub fn update<F>(&self, id: TxId, note: &str, mutator: F) -> Result<TransactionRecord>
    where
        F: FnOnce(&mut TransactionRecord) -> Result<()>,
    {
        let (previous, updated) = {
            let mut entry = self
                .transactions
                .get_mut(&id)
                .ok_or(TxPipelineError::NotFound(id))?;

            let previous_status = entry.status;
            let mut next = entry.clone();
            mutator(&mut next)?;
            next.id = id;
            next.history = Vec::new();

            if next.status != previous_status && !previous_status.can_transition_to(next.status) {
                return Err(TxPipelineError::InvalidTransition {
                    id,
                    from: previous_status,
                    to: next.status,
                });
            }

            let changes = history::diff(&history::snapshot(&entry), &history::snapshot(&next));
            next.history = std::mem::take(&mut entry.history);
            next.history.push(HistoryEntry {
                timestamp: chrono::Utc::now(),
                note: note.to_string(),
                changes,
            });

            *entry = next;
            (previous_status, entry.clone())
        };

        self.notify_update(previous, &updated, note);
        self.prune();
        Ok(updated)
    }

    /// Move a record to `status`, failing if the edge is not allowed.
    pub fn set_status(&self, id: TxId, status: TxStatus, note: &str) -> Result<TransactionRecord> {
        self.update(id, note, |record| {
            record.status = status;
            Ok(())
        })
    }

    fn notify_update(&self, previous: TxStatus, record: &TransactionRecord, note: &str) {
        let id = record.id;
        self.events.broadcast(StateEvent::Updated {
            id,
            status: record.status,
            note: note.to_string(),
        });

        if previous == record.status {
            return;
        }

        log::info!("[Ledger] Transaction {} status {} -> {}", id, previous, record.status);
        self.events.broadcast(StateEvent::StatusChanged {
            id,
            from: previous,
            to: record.status,
        });

        match record.status {
            TxStatus::Confirmed => self.events.broadcast(StateEvent::Confirmed { id, hash: record.hash }),
            TxStatus::Failed => self.events.broadcast(StateEvent::Failed {
                id,
                error: record.error.clone(),
            }),
            TxStatus::Dropped => self.events.broadcast(StateEvent::Dropped {
                id,
                replaced_by: record.replaced_by,
            }),
            TxStatus::Rejected => self.events.broadcast(StateEvent::Rejected { id }),
            _ => {}
        }

        if settles(record.status) {
            if let Some((_, waiters)) = self.settlements.remove(&id) {
                for waiter in waiters {
                    let _ = waiter.send(record.clone());
                }
            }
        }
    }

    /// Publish a warning notification for a record.
    pub(crate) fn emit(&self, event: StateEvent) {
        self.events.broadcast(event);
    }

    /// Resolves once the record first reaches `submitted` or a terminal status.
    ///
    /// Resolves immediately if the record is already there. The sender is
    /// dropped without a value if the record is removed first.
    pub fn settled(&self, id: TxId) -> Result<oneshot::Receiver<TransactionRecord>> {
        let (tx, rx) = oneshot::channel();
        let entry = self.transactions.get(&id).ok_or(TxPipelineError::NotFound(id))?;
        if settles(entry.status) {
            let _ = tx.send(entry.clone());
        } else {
            self.settlements.entry(id).or_default().push(tx);
        }
        Ok(rx)
    }

    /// Matching records in insertion order, as a one-shot snapshot.
    pub fn query(&self, filter: &TxFilter) -> std::vec::IntoIter<TransactionRecord> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|id| self.transactions.get(id).map(|r| r.clone()))
            .filter(|r| filter.matches(r))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// All records in insertion order
    pub fn snapshot(&self) -> Vec<TransactionRecord> {
        self.query(&TxFilter::default()).collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn subscribe(&self) -> (String, mpsc::Receiver<StateEvent>) {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.events.unsubscribe(client_id)
    }

    /// Remove every record sent by `address`, optionally limited to one chain.
    pub fn remove_by_sender(&self, address: Address, chain_id: Option<u64>) -> Vec<TxId> {
        let mut removed = Vec::new();
        {
            let mut order = self.order.lock();
            order.retain(|id| {
                let matches = self
                    .transactions
                    .get(id)
                    .map(|r| r.params.from == address && chain_id.is_none_or(|c| r.params.chain_id == c))
                    .unwrap_or(false);
                if matches {
                    self.transactions.remove(id);
                    self.settlements.remove(id);
                    removed.push(*id);
                }
                !matches
            });
        }
        if !removed.is_empty() {
            log::info!("[Ledger] Removed {} transactions from {:?}", removed.len(), address);
            self.events.broadcast(StateEvent::Removed { ids: removed.clone() });
        }
        removed
    }

    /// Drop the oldest terminal records while over the retention limit.
    /// Non-terminal records are never pruned.
    fn prune(&self) -> Vec<TxId> {
        let mut pruned = Vec::new();
        {
            let mut order = self.order.lock();
            if order.len() <= self.retention_limit {
                return pruned;
            }
            let mut excess = order.len() - self.retention_limit;
            order.retain(|id| {
                if excess == 0 {
                    return true;
                }
                let terminal = self
                    .transactions
                    .get(id)
                    .map(|r| r.status.is_terminal())
                    .unwrap_or(true);
                if terminal {
                    self.transactions.remove(id);
                    self.settlements.remove(id);
                    pruned.push(*id);
                    excess -= 1;
                }
                !terminal
            });
        }
        if !pruned.is_empty() {
            log::debug!("[Ledger] Pruned {} finalized transactions", pruned.len());
            self.events.broadcast(StateEvent::Pruned { ids: pruned.clone() });
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RecordedError};
    use crate::testing::{params_from, record_from};

    fn store_with_limit(limit: usize) -> LedgerStore {
        LedgerStore::new(&PipelineConfig {
            retention_limit: limit,
            ..Default::default()
        })
    }

    #[test]
    fn test_add_and_get() {
        let store = store_with_limit(10);
        let record = store.add(record_from(1)).unwrap();

        let retrieved = store.get(record.id).unwrap();
        assert_eq!(retrieved.id, record.id);
        assert_eq!(retrieved.status, TxStatus::Unapproved);
    }

    #[test]
    fn test_add_duplicate_id_fails() {
        let store = store_with_limit(10);
        let record = record_from(1);
        store.add(record.clone()).unwrap();
        assert!(matches!(store.add(record), Err(TxPipelineError::DuplicateId(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_missing_record() {
        let store = store_with_limit(10);
        let err = store.set_status(TxId::new(), TxStatus::Approved, "test").unwrap_err();
        assert!(matches!(err, TxPipelineError::NotFound(_)));
    }

    #[test]
    fn test_status_updates_append_history() {
        let store = store_with_limit(10);
        let id = store.add(record_from(1)).unwrap().id;

        store.set_status(id, TxStatus::Approved, "approve").unwrap();
        store
            .update(id, "nonce", |r| {
                r.params.nonce = Some(4);
                Ok(())
            })
            .unwrap();
        store.set_status(id, TxStatus::Signed, "sign").unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.status, TxStatus::Signed);
        assert_eq!(record.history.len(), 3);
        assert_eq!(record.history[1].note, "nonce");
        assert_eq!(record.history[1].changes[0].path, "/params/nonce");
    }

    #[test]
    fn test_illegal_transition_is_not_committed() {
        let store = store_with_limit(10);
        let id = store.add(record_from(1)).unwrap().id;

        let err = store.set_status(id, TxStatus::Confirmed, "skip ahead").unwrap_err();
        assert!(matches!(err, TxPipelineError::InvalidTransition { .. }));

        let record = store.get(id).unwrap();
        assert_eq!(record.status, TxStatus::Unapproved);
        assert!(record.history.is_empty());
    }

    #[test]
    fn test_failed_mutator_leaves_record_untouched() {
        let store = store_with_limit(10);
        let id = store.add(record_from(1)).unwrap().id;

        let result = store.update(id, "bad", |r| {
            r.params.nonce = Some(9);
            Err(TxPipelineError::Validation("nope".to_string()))
        });
        assert!(result.is_err());
        let record = store.get(id).unwrap();
        assert!(record.params.nonce.is_none());
        assert!(record.history.is_empty());
    }

    #[test]
    fn test_terminal_record_rejects_status_change() {
        let store = store_with_limit(10);
        let id = store.add(record_from(1)).unwrap().id;
        store.set_status(id, TxStatus::Rejected, "cancel").unwrap();

        for status in [TxStatus::Approved, TxStatus::Failed, TxStatus::Unapproved] {
            assert!(store.set_status(id, status, "again").is_err());
        }
        assert_eq!(store.get(id).unwrap().status, TxStatus::Rejected);
    }

    #[test]
    fn test_query_by_status_and_sender() {
        let store = store_with_limit(10);
        let a = store.add(record_from(1)).unwrap().id;
        let b = store.add(record_from(1)).unwrap().id;
        store.add(record_from(2)).unwrap();

        store.set_status(a, TxStatus::Approved, "approve").unwrap();

        let approved: Vec<_> = store
            .query(&TxFilter::new().from(params_from(1).from).status(TxStatus::Approved))
            .collect();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].id, a);

        let unapproved: Vec<_> = store
            .query(&TxFilter::new().from(params_from(1).from).status(TxStatus::Unapproved))
            .collect();
        assert_eq!(unapproved.len(), 1);
        assert_eq!(unapproved[0].id, b);
    }

    #[test]
    fn test_query_excludes_errored() {
        let store = store_with_limit(10);
        let id = store.add(record_from(1)).unwrap().id;
        store
            .update(id, "fail", |r| {
                r.status = TxStatus::Failed;
                r.error = Some(RecordedError::new(ErrorKind::Sign, "boom"));
                Ok(())
            })
            .unwrap();
        assert_eq!(store.query(&TxFilter::new().without_errors()).count(), 0);
        assert_eq!(store.query(&TxFilter::new()).count(), 1);
    }

    #[test]
    fn test_prune_removes_oldest_terminal_first() {
        let store = store_with_limit(3);
        let ids: Vec<_> = (0..3).map(|_| store.add(record_from(1)).unwrap().id).collect();
        store.set_status(ids[1], TxStatus::Rejected, "cancel").unwrap();
        store.set_status(ids[2], TxStatus::Rejected, "cancel").unwrap();

        store.add(record_from(1)).unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.get(ids[0]).is_some(), "non-terminal record must survive");
        assert!(store.get(ids[1]).is_none(), "oldest terminal record pruned");
        assert!(store.get(ids[2]).is_some());
    }

    #[test]
    fn test_prune_never_removes_non_terminal() {
        let store = store_with_limit(2);
        for _ in 0..5 {
            store.add(record_from(1)).unwrap();
        }
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let store = store_with_limit(10);
        let (_client, mut rx) = store.subscribe();
        let id = store.add(record_from(1)).unwrap().id;
        store.set_status(id, TxStatus::Rejected, "cancel").unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["tx.added", "tx.updated", "tx.status_changed", "tx.rejected"]);
    }

    #[tokio::test]
    async fn test_settled_fires_once_on_terminal() {
        let store = store_with_limit(10);
        let id = store.add(record_from(1)).unwrap().id;
        let rx = store.settled(id).unwrap();

        store.set_status(id, TxStatus::Rejected, "cancel").unwrap();
        let record = rx.await.unwrap();
        assert_eq!(record.status, TxStatus::Rejected);

        let again = store.settled(id).unwrap().await.unwrap();
        assert_eq!(again.status, TxStatus::Rejected);
    }

    #[tokio::test]
    async fn test_settled_dropped_when_record_removed() {
        let store = store_with_limit(10);
        let record = store.add(record_from(1)).unwrap();
        let rx = store.settled(record.id).unwrap();
        store.remove_by_sender(record.params.from, None);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_remove_by_sender_keeps_other_accounts() {
        let store = store_with_limit(10);
        store.add(record_from(1)).unwrap();
        store.add(record_from(1)).unwrap();
        let other = store.add(record_from(2)).unwrap().id;

        let removed = store.remove_by_sender(params_from(1).from, None);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(other).is_some());
    }

    #[test]
    fn test_from_snapshot_preserves_order() {
        let records = vec![record_from(1), record_from(2), record_from(3)];
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        let store = LedgerStore::from_snapshot(records, &PipelineConfig::default()).unwrap();
        let restored: Vec<_> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(restored, ids);
    }
}
