//! Nonce allocation
//!
//! The next nonce for an address is the larger of what the chain reports
//! (pending-inclusive) and one past the highest nonce among local in-flight
//! records. The computation runs while holding the address lane, and the
//! lane stays held until the returned `NonceLock` is released.

use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit};
use uuid::Uuid;

use super::lanes::{LaneGuard, LaneStats, NonceLanes};
use crate::error::{Result, TxPipelineError};
use crate::ledger::{LedgerStore, NonceDetails, TxFilter, TxStatus};
use crate::rpc::ChainProvider;

/// Exclusive right to use `next_nonce` for `address`
pub struct NonceLock {
    address: Address,
    next_nonce: u64,
    nonce_details: NonceDetails,
    lane: Option<LaneGuard>,
}

impl NonceLock {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }

    pub fn nonce_details(&self) -> &NonceDetails {
        &self.nonce_details
    }

    /// Give the address lane back to the next waiter.
    pub fn release(mut self) {
        if let Some(lane) = self.lane.take() {
            log::debug!(
                "[Nonce] Released lock {} for {:?} after {:?}",
                self.nonce_details.lock_holder,
                self.address,
                lane.held_duration()
            );
        }
    }
}

impl Drop for NonceLock {
    fn drop(&mut self) {
        if self.lane.take().is_some() {
            log::debug!(
                "[Nonce] Lock {} for {:?} released on drop",
                self.nonce_details.lock_holder,
                self.address
            );
        }
    }
}

fn lane_closed(address: Address, error: AcquireError) -> TxPipelineError {
    TxPipelineError::Nonce {
        address: format!("{:?}", address),
        message: error.to_string(),
    }
}

pub struct NonceAllocator {
    lanes: Arc<NonceLanes>,
    store: Arc<LedgerStore>,
    provider: Arc<dyn ChainProvider>,
}

impl NonceAllocator {
    pub fn new(store: Arc<LedgerStore>, provider: Arc<dyn ChainProvider>) -> Self {
        Self {
            lanes: NonceLanes::new(),
            store,
            provider,
        }
    }

    /// Wait for the address lane and compute the next nonce.
    ///
    /// The global lane is held only while the nonce is computed, so a sync
    /// sweep never overlaps a computation. On provider failure the lane is
    /// released before the error is returned.
    pub async fn acquire(&self, address: Address) -> Result<NonceLock> {
        let lane = self.lanes.acquire(address).await.map_err(|e| lane_closed(address, e))?;
        let global = self
            .lanes
            .acquire_global()
            .await
            .map_err(|e| lane_closed(address, e))?;

        let network_next_nonce = self.provider.next_nonce(address).await.map_err(|e| {
            log::warn!("[Nonce] Failed to fetch nonce for {:?}: {}", address, e);
            TxPipelineError::Nonce {
                address: format!("{:?}", address),
                message: e.to_string(),
            }
        })?;
        let local_next_nonce = self.local_next_nonce(address);
        drop(global);

        let allocated = local_next_nonce.map_or(network_next_nonce, |local| local.max(network_next_nonce));
        let nonce_details = NonceDetails {
            network_next_nonce,
            local_next_nonce,
            allocated,
            lock_holder: Uuid::new_v4().to_string(),
        };

        log::debug!(
            "[Nonce] Allocated {} for {:?} (network {}, local {:?})",
            allocated,
            address,
            network_next_nonce,
            local_next_nonce
        );

        Ok(NonceLock {
            address,
            next_nonce: allocated,
            nonce_details,
            lane: Some(lane),
        })
    }

    /// One past the highest nonce among non-errored in-flight records
    fn local_next_nonce(&self, address: Address) -> Option<u64> {
        let filter = TxFilter::new()
            .from(address)
            .statuses(&[TxStatus::Approved, TxStatus::Signed, TxStatus::Submitted])
            .without_errors();
        self.store
            .query(&filter)
            .filter_map(|r| r.params.nonce)
            .max()
            .map(|highest| highest + 1)
    }

    /// Block every nonce computation until the permit is dropped.
    pub async fn global_lock(&self) -> Result<OwnedSemaphorePermit> {
        self.lanes.acquire_global().await.map_err(|e| TxPipelineError::Nonce {
            address: "global".to_string(),
            message: e.to_string(),
        })
    }

    pub fn is_locked(&self, address: Address) -> bool {
        self.lanes.is_locked(address)
    }

    pub fn prune_idle(&self) -> usize {
        self.lanes.prune_idle()
    }

    pub fn stats(&self) -> LaneStats {
        self.lanes.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::testing::{MockProvider, params_from, record_from};
    use crate::ledger::TransactionRecord;

    fn setup(chain_nonce: u64) -> (Arc<LedgerStore>, Arc<MockProvider>, NonceAllocator) {
        let store = Arc::new(LedgerStore::new(&PipelineConfig::default()));
        let provider = Arc::new(MockProvider::new());
        provider.set_nonce(params_from(1).from, chain_nonce);
        let allocator = NonceAllocator::new(store.clone(), provider.clone());
        (store, provider, allocator)
    }

    fn in_flight(store: &LedgerStore, nonce: u64, status: TxStatus) -> TransactionRecord {
        let id = store.add(record_from(1)).unwrap().id;
        store.set_status(id, TxStatus::Approved, "approve").unwrap();
        store
            .update(id, "nonce", |r| {
                r.params.nonce = Some(nonce);
                r.status = status;
                Ok(())
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_uses_network_nonce_without_local_records() {
        let (_store, _provider, allocator) = setup(7);
        let lock = allocator.acquire(params_from(1).from).await.unwrap();
        assert_eq!(lock.next_nonce(), 7);
        assert_eq!(lock.nonce_details().local_next_nonce, None);
        lock.release();
    }

    #[tokio::test]
    async fn test_local_in_flight_wins_over_stale_network() {
        let (store, _provider, allocator) = setup(3);
        in_flight(&store, 3, TxStatus::Signed);
        in_flight(&store, 4, TxStatus::Signed);

        let lock = allocator.acquire(params_from(1).from).await.unwrap();
        assert_eq!(lock.next_nonce(), 5);
        assert_eq!(lock.nonce_details().network_next_nonce, 3);
        assert_eq!(lock.nonce_details().local_next_nonce, Some(5));
    }

    #[tokio::test]
    async fn test_errored_records_are_ignored() {
        let (store, _provider, allocator) = setup(2);
        let record = in_flight(&store, 2, TxStatus::Signed);
        store
            .update(record.id, "fail", |r| {
                r.status = TxStatus::Failed;
                r.error = Some(crate::error::RecordedError::new(crate::error::ErrorKind::Publish, "x"));
                Ok(())
            })
            .unwrap();

        let lock = allocator.acquire(params_from(1).from).await.unwrap();
        assert_eq!(lock.next_nonce(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_releases_lane() {
        let (_store, provider, allocator) = setup(0);
        let address = params_from(1).from;
        provider.fail_nonce(true);

        let err = allocator.acquire(address).await.err().unwrap();
        assert!(matches!(err, TxPipelineError::Nonce { .. }));
        assert!(!allocator.is_locked(address));

        provider.fail_nonce(false);
        assert!(allocator.acquire(address).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let (_store, _provider, allocator) = setup(0);
        let allocator = Arc::new(allocator);
        let address = params_from(1).from;

        let first = allocator.acquire(address).await.unwrap();
        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.acquire(address).await.map(|l| l.next_nonce()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        first.release();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_lock_releases_lane() {
        let (_store, _provider, allocator) = setup(0);
        let address = params_from(1).from;
        {
            let _lock = allocator.acquire(address).await.unwrap();
            assert!(allocator.is_locked(address));
        }
        assert!(!allocator.is_locked(address));
    }

    #[tokio::test]
    async fn test_global_lock_blocks_allocation() {
        let (_store, _provider, allocator) = setup(0);
        let allocator = Arc::new(allocator);
        let global = allocator.global_lock().await.unwrap();
        let address = params_from(1).from;

        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.acquire(address).await.map(|l| l.next_nonce()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        // The address lane is taken first; only the computation waits
        assert!(allocator.is_locked(address));

        drop(global);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }
}
