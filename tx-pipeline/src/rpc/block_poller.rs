//! Polls a node for new blocks and feeds the pending monitor.

use ethers::types::H256;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::EthersProvider;

/// Blocks fetched per poll when the poller falls behind
const MAX_BLOCKS_PER_POLL: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A block and the hashes of the transactions it includes
    NewBlock { number: u64, tx_hashes: Vec<H256> },
    /// Liveness tick carrying the current head
    Latest { number: u64 },
    /// Periodic reconciliation tick
    Sync,
}

pub struct BlockPoller {
    provider: EthersProvider,
    poll_interval: Duration,
    sync_interval: Duration,
}

impl BlockPoller {
    pub fn new(provider: EthersProvider, poll_interval: Duration, sync_interval: Duration) -> Self {
        Self {
            provider,
            poll_interval,
            sync_interval,
        }
    }

    /// Run until `cancel` fires or the receiving side is closed.
    pub async fn run(self, events: mpsc::Sender<ChainEvent>, cancel: CancellationToken) {
        log::info!(
            "[Rpc] Block poller started (poll {:?}, sync {:?})",
            self.poll_interval,
            self.sync_interval
        );

        let mut poll = tokio::time::interval(self.poll_interval);
        let mut sync = tokio::time::interval(self.sync_interval);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen: Option<u64> = None;

        loop {
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => self.poll_once(&events, &mut last_seen).await,
                _ = sync.tick() => events.send(ChainEvent::Sync).await.is_ok(),
            };
            if !sent {
                log::info!("[Rpc] Event receiver closed, stopping block poller");
                break;
            }
        }

        log::info!("[Rpc] Block poller stopped");
    }

    /// Returns false once the receiver is gone.
    async fn poll_once(&self, events: &mpsc::Sender<ChainEvent>, last_seen: &mut Option<u64>) -> bool {
        let head = match self.provider.block_number().await {
            Ok(head) => head,
            Err(e) => {
                log::warn!("[Rpc] Failed to fetch block number: {}", e);
                return true;
            }
        };

        for number in blocks_to_fetch(*last_seen, head) {
            match self.provider.block_tx_hashes(number).await {
                Ok(Some(tx_hashes)) => {
                    log::debug!("[Rpc] Block {} with {} transactions", number, tx_hashes.len());
                    if events.send(ChainEvent::NewBlock { number, tx_hashes }).await.is_err() {
                        return false;
                    }
                    *last_seen = Some(number);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[Rpc] Failed to fetch block {}: {}", number, e);
                    break;
                }
            }
        }

        match *last_seen {
            Some(number) => events.send(ChainEvent::Latest { number }).await.is_ok(),
            None => true,
        }
    }
}

/// Block numbers still to fetch, oldest first, capped per poll
fn blocks_to_fetch(last_seen: Option<u64>, head: u64) -> std::ops::RangeInclusive<u64> {
    let start = match last_seen {
        Some(last) => last + 1,
        None => head,
    };
    let end = head.min(start.saturating_add(MAX_BLOCKS_PER_POLL - 1));
    start..=end
}
