//! Keyed lanes
//!
//! One single-permit semaphore per sender address, plus a global lane that
//! excludes every nonce computation while it is held. A lane is released when
//! its guard is dropped.

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Lanes held longer than this are logged when released
const LANE_HOLD_WARNING_SECS: u64 = 60;

/// Time after which an unused lane can be pruned
const LANE_IDLE_TIMEOUT_SECS: u64 = 3600;

struct LaneMetadata {
    last_used: Instant,
    total_uses: u64,
}

/// Exclusive hold on one address lane
pub struct LaneGuard {
    address: Address,
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
    lanes: Arc<NonceLanes>,
}

impl LaneGuard {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held.as_secs() > LANE_HOLD_WARNING_SECS {
            log::warn!(
                "[Nonce] Lane for {:?} held for {} seconds",
                self.address,
                held.as_secs()
            );
        }
        if let Some(mut entry) = self.lanes.metadata.get_mut(&self.address) {
            entry.last_used = Instant::now();
        }
    }
}

pub struct NonceLanes {
    /// permits = 1, so one holder per address
    lanes: DashMap<Address, Arc<Semaphore>>,
    metadata: DashMap<Address, LaneMetadata>,
    global_lane: Arc<Semaphore>,
}

impl NonceLanes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lanes: DashMap::new(),
            metadata: DashMap::new(),
            global_lane: Arc::new(Semaphore::new(1)),
        })
    }

    /// Wait for exclusive access to `address`.
    ///
    /// Fails only if the lane's semaphore was closed.
    pub async fn acquire(self: &Arc<Self>, address: Address) -> Result<LaneGuard, AcquireError> {
        let semaphore = self.get_or_create_lane(address);
        let permit = semaphore.acquire_owned().await?;
        Ok(self.guard(address, permit))
    }

    /// Take the lane only if it is free right now.
    pub fn try_acquire(self: &Arc<Self>, address: Address) -> Option<LaneGuard> {
        let semaphore = self.get_or_create_lane(address);
        semaphore
            .try_acquire_owned()
            .ok()
            .map(|permit| self.guard(address, permit))
    }

    /// Hold the global lane. Address lanes can still be taken, but nonce
    /// computation waits for this permit.
    pub async fn acquire_global(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.global_lane.clone().acquire_owned().await
    }

    pub fn is_locked(&self, address: Address) -> bool {
        self.lanes
            .get(&address)
            .map(|s| s.available_permits() == 0)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> LaneStats {
        LaneStats {
            total_lanes: self.lanes.len(),
            active_lanes: self
                .lanes
                .iter()
                .filter(|s| s.available_permits() == 0)
                .count(),
            total_acquisitions: self.metadata.iter().map(|m| m.total_uses).sum(),
        }
    }

    /// Forget lanes that are free and unused for longer than the idle timeout.
    ///
    /// A lane whose semaphore is shared outside the map belongs to an acquire
    /// in progress and is kept.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_older_than(Duration::from_secs(LANE_IDLE_TIMEOUT_SECS))
    }

    fn prune_idle_older_than(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<Address> = self
            .metadata
            .iter()
            .filter(|m| now.duration_since(m.last_used) >= idle)
            .map(|m| *m.key())
            .collect();

        let mut pruned = 0;
        for address in stale {
            let removed = self
                .lanes
                .remove_if(&address, |_, lane| {
                    Arc::strong_count(lane) == 1 && lane.available_permits() > 0
                })
                .is_some();
            if removed {
                self.metadata
                    .remove_if(&address, |_, m| now.duration_since(m.last_used) >= idle);
                pruned += 1;
            }
        }
        pruned
    }

    fn guard(self: &Arc<Self>, address: Address, permit: OwnedSemaphorePermit) -> LaneGuard {
        self.metadata
            .entry(address)
            .and_modify(|m| {
                m.last_used = Instant::now();
                m.total_uses += 1;
            })
            .or_insert_with(|| LaneMetadata {
                last_used: Instant::now(),
                total_uses: 1,
            });

        LaneGuard {
            address,
            _permit: permit,
            acquired_at: Instant::now(),
            lanes: Arc::clone(self),
        }
    }

    fn get_or_create_lane(&self, address: Address) -> Arc<Semaphore> {
        self.lanes
            .entry(address)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStats {
    pub total_lanes: usize,
    pub active_lanes: usize,
    pub total_acquisitions: u64,
}
