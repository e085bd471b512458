//! Resubmission timing and publish error classification

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::ledger::TransactionRecord;

/// Errors meaning the node already has this transaction, or an equivalent one
const KNOWN_TRANSACTION_ERRORS: &[&str] = &[
    "replacement transaction underpriced",
    "known transaction",
    "already known",
    "gas price too low to replace",
    "transaction with the same hash was already imported",
    "gateway timeout",
];

/// Errors meaning the nonce was consumed on-chain
const NONCE_CONSUMED_ERRORS: &[&str] = &["nonce too low", "nonce has already been used", "already used"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResubmitPolicy {
    pub enabled: bool,
    /// Minimum time since publish before the first re-broadcast
    pub min_age: Duration,
    /// Upper bound on the block gap between retries
    pub max_block_distance: u64,
}

impl Default for ResubmitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_age: Duration::ZERO,
            max_block_distance: 50,
        }
    }
}

impl ResubmitPolicy {
    /// Blocks that must pass since the first retry block before the next retry
    pub fn required_blocks(&self, retry_count: u32) -> u64 {
        let backoff = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        backoff.min(self.max_block_distance)
    }

    /// Whether `record` should be re-broadcast at `latest_block`.
    ///
    /// Records without a first retry block are never due; the caller sets
    /// it on the first liveness tick.
    pub fn is_due(&self, record: &TransactionRecord, latest_block: u64, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(first_retry_block) = record.first_retry_block else {
            return false;
        };

        let submitted_at = record.submitted_at.unwrap_or(record.created_at);
        let age = now.signed_duration_since(submitted_at).to_std().unwrap_or(Duration::ZERO);
        if age < self.min_age {
            return false;
        }

        latest_block.saturating_sub(first_retry_block) >= self.required_blocks(record.retry_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorClass {
    /// Node already has it; nothing to do
    Known,
    /// Nonce no longer usable by this transaction
    NonceConsumed,
    Other,
}

pub fn classify_publish_error(message: &str) -> PublishErrorClass {
    let message = message.to_lowercase();
    if KNOWN_TRANSACTION_ERRORS.iter().any(|known| message.contains(known)) {
        PublishErrorClass::Known
    } else if NONCE_CONSUMED_ERRORS.iter().any(|known| message.contains(known)) {
        PublishErrorClass::NonceConsumed
    } else {
        PublishErrorClass::Other
    }
}
