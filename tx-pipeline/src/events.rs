//! Notification channel for ledger state changes
//!
//! The ledger store publishes a `StateEvent` for every accepted mutation.
//! Subscribers each get their own bounded channel; a slow subscriber loses
//! events rather than stalling the writer.

use dashmap::DashMap;
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RecordedError;
use crate::ledger::{TxId, TxStatus, TxWarning};

/// Max number of recent events kept for replay to late subscribers
const EVENT_BUFFER_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    Added { id: TxId, from: Address },
    Updated { id: TxId, status: TxStatus, note: String },
    StatusChanged { id: TxId, from: TxStatus, to: TxStatus },
    Confirmed { id: TxId, hash: Option<H256> },
    Failed { id: TxId, error: Option<RecordedError> },
    Dropped { id: TxId, replaced_by: Option<H256> },
    Rejected { id: TxId },
    Warning { id: TxId, warning: TxWarning },
    Pruned { ids: Vec<TxId> },
    Removed { ids: Vec<TxId> },
}

impl StateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StateEvent::Added { .. } => "tx.added",
            StateEvent::Updated { .. } => "tx.updated",
            StateEvent::StatusChanged { .. } => "tx.status_changed",
            StateEvent::Confirmed { .. } => "tx.confirmed",
            StateEvent::Failed { .. } => "tx.failed",
            StateEvent::Dropped { .. } => "tx.dropped",
            StateEvent::Rejected { .. } => "tx.rejected",
            StateEvent::Warning { .. } => "tx.warning",
            StateEvent::Pruned { .. } => "tx.pruned",
            StateEvent::Removed { .. } => "tx.removed",
        }
    }

    /// The single record this event concerns, if any
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            StateEvent::Added { id, .. }
            | StateEvent::Updated { id, .. }
            | StateEvent::StatusChanged { id, .. }
            | StateEvent::Confirmed { id, .. }
            | StateEvent::Failed { id, .. }
            | StateEvent::Dropped { id, .. }
            | StateEvent::Rejected { id }
            | StateEvent::Warning { id, .. } => Some(*id),
            StateEvent::Pruned { .. } | StateEvent::Removed { .. } => None,
        }
    }
}

/// Fans state events out to every subscriber.
pub struct EventBroadcaster {
    clients: DashMap<String, mpsc::Sender<StateEvent>>,
    recent_events: Mutex<VecDeque<StateEvent>>,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            recent_events: Mutex::new(VecDeque::with_capacity(EVENT_BUFFER_SIZE)),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe a new client and return (client_id, receiver).
    pub fn subscribe(&self) -> (String, mpsc::Receiver<StateEvent>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.clients.insert(client_id.clone(), tx);
        log::debug!("[Events] Client {} subscribed", client_id);
        (client_id, rx)
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.clients.remove(client_id);
        log::debug!("[Events] Client {} unsubscribed", client_id);
    }

    /// Snapshot of recent events for replaying to newly connected clients.
    pub fn get_recent_events(&self) -> Vec<StateEvent> {
        self.recent_events.lock().iter().cloned().collect()
    }

    /// Deliver an event to all current subscribers. Never blocks.
    pub fn broadcast(&self, event: StateEvent) {
        {
            let mut buffer = self.recent_events.lock();
            if buffer.len() >= EVENT_BUFFER_SIZE {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        let event_name = event.name();
        let mut failed_clients = Vec::new();

        for entry in self.clients.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "[Events] Channel full for client {}, dropping '{}' event",
                        entry.key(),
                        event_name
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    failed_clients.push(entry.key().clone());
                }
            }
        }

        for client_id in failed_clients {
            self.clients.remove(&client_id);
            log::debug!("[Events] Removed disconnected client {}", client_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = EventBroadcaster::default();
        let (_a, mut rx_a) = broadcaster.subscribe();
        let (_b, mut rx_b) = broadcaster.subscribe();

        let id = TxId::new();
        broadcaster.broadcast(StateEvent::Rejected { id });

        assert_eq!(rx_a.recv().await, Some(StateEvent::Rejected { id }));
        assert_eq!(rx_b.recv().await, Some(StateEvent::Rejected { id }));
    }

    #[test]
    fn test_closed_subscribers_are_removed() {
        let broadcaster = EventBroadcaster::default();
        let (_id, rx) = broadcaster.subscribe();
        assert_eq!(broadcaster.client_count(), 1);

        drop(rx);
        broadcaster.broadcast(StateEvent::Pruned { ids: vec![] });
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[test]
    fn test_full_channel_drops_event_without_blocking() {
        let broadcaster = EventBroadcaster::new(1);
        let (_id, mut rx) = broadcaster.subscribe();

        broadcaster.broadcast(StateEvent::Pruned { ids: vec![] });
        broadcaster.broadcast(StateEvent::Removed { ids: vec![] });

        assert_eq!(rx.try_recv().unwrap(), StateEvent::Pruned { ids: vec![] });
        assert!(rx.try_recv().is_err());
        assert_eq!(broadcaster.get_recent_events().len(), 2);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let id = TxId::new();
        let json = serde_json::to_value(StateEvent::Rejected { id }).unwrap();
        assert_eq!(json["event"], "rejected");
    }
}
