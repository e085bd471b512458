//! Transaction record data types

use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, TransactionRequest, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::history::HistoryEntry;
use crate::error::RecordedError;

/// Unique identifier of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub uuid::Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a transaction record
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxStatus {
    /// Created, waiting for the user to approve or cancel
    Unapproved,
    /// Approved, nonce being allocated
    Approved,
    /// Signed but not yet broadcast
    Signed,
    /// Broadcast to the network, has a hash but is not yet confirmed
    Submitted,
    /// Included on-chain
    Confirmed,
    /// Errored during approval, signing, publishing, or reverted on-chain
    Failed,
    /// Cancelled by the user before approval
    Rejected,
    /// Nonce consumed by another transaction before confirmation
    Dropped,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Rejected | TxStatus::Dropped
        )
    }

    /// Statuses counted as in-flight when allocating nonces
    pub fn is_in_flight(self) -> bool {
        matches!(self, TxStatus::Approved | TxStatus::Signed | TxStatus::Submitted)
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        match self {
            Unapproved => matches!(next, Approved | Rejected | Failed),
            Approved => matches!(next, Signed | Failed),
            Signed => matches!(next, Submitted | Failed),
            Submitted => matches!(next, Confirmed | Failed | Dropped),
            Confirmed | Failed | Rejected | Dropped => false,
        }
    }
}

/// Transaction parameters as requested by a caller, before defaults are applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub chain_id: Option<u64>,
    pub data: Option<Bytes>,
}

impl TxRequest {
    /// A plain value transfer
    pub fn transfer(from: Address, to: Address, value: U256) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            value: Some(value),
            ..Default::default()
        }
    }
}

/// Fully-populated transaction parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: U256,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    /// Absent until the record is approved
    pub nonce: Option<u64>,
    pub chain_id: u64,
    pub data: Option<Bytes>,
}

impl TxParams {
    pub fn is_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some()
    }

    /// Effective price used when comparing or bumping fees
    pub fn fee_cap(&self) -> Option<U256> {
        self.max_fee_per_gas.or(self.gas_price)
    }

    /// Legacy or EIP-1559 request carrying these params. The nonce is set
    /// only once assigned.
    pub fn typed_transaction(&self) -> TypedTransaction {
        if self.is_eip1559() {
            let mut tx = Eip1559TransactionRequest::new()
                .from(self.from)
                .value(self.value)
                .gas(self.gas)
                .chain_id(self.chain_id);
            if let Some(nonce) = self.nonce {
                tx = tx.nonce(nonce);
            }
            if let Some(to) = self.to {
                tx = tx.to(to);
            }
            if let Some(data) = &self.data {
                tx = tx.data(data.clone());
            }
            if let Some(max_fee) = self.max_fee_per_gas {
                tx = tx.max_fee_per_gas(max_fee);
            }
            if let Some(priority_fee) = self.max_priority_fee_per_gas {
                tx = tx.max_priority_fee_per_gas(priority_fee);
            }
            tx.into()
        } else {
            let mut tx = TransactionRequest::new()
                .from(self.from)
                .value(self.value)
                .gas(self.gas)
                .chain_id(self.chain_id);
            if let Some(nonce) = self.nonce {
                tx = tx.nonce(nonce);
            }
            if let Some(to) = self.to {
                tx = tx.to(to);
            }
            if let Some(data) = &self.data {
                tx = tx.data(data.clone());
            }
            if let Some(gas_price) = self.gas_price {
                tx = tx.gas_price(gas_price);
            }
            tx.into()
        }
    }
}

/// Diagnostic snapshot of the nonce computation used for a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceDetails {
    /// Next nonce reported by the chain (pending-inclusive)
    pub network_next_nonce: u64,
    /// One more than the highest in-flight local nonce, if any
    pub local_next_nonce: Option<u64>,
    pub allocated: u64,
    /// Id of the lock that produced this allocation
    pub lock_holder: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxKind {
    Standard,
    /// Same nonce as an earlier record, higher fee
    SpeedUp,
    /// Zero-value self-transfer competing for an earlier record's nonce
    Cancel,
}

/// Nonce reuse for speed-up and cancel records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub original_id: TxId,
    pub nonce: u64,
}

/// Non-fatal problem observed while monitoring a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWarning {
    pub error: String,
    pub message: String,
}

/// Receipt data for an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    /// `true` for status 1, `false` for a revert
    pub success: bool,
}

/// One transaction request and its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxId,
    pub status: TxStatus,
    pub kind: TxKind,
    pub created_at: DateTime<Utc>,
    pub params: TxParams,
    /// Set only after a successful publish
    pub hash: Option<H256>,
    /// Signed wire-encoded transaction, kept for resubmission
    pub raw_signed: Option<Bytes>,
    pub nonce_details: Option<NonceDetails>,
    pub replacement: Option<Replacement>,
    /// Present only on `failed` and `dropped`
    pub error: Option<RecordedError>,
    pub warning: Option<TxWarning>,
    pub receipt: Option<TxReceipt>,
    /// Hash of the confirmed transaction that consumed this record's nonce
    pub replaced_by: Option<H256>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub first_retry_block: Option<u64>,
    pub history: Vec<HistoryEntry>,
}

impl TransactionRecord {
    pub fn new(params: TxParams) -> Self {
        Self {
            id: TxId::new(),
            status: TxStatus::Unapproved,
            kind: TxKind::Standard,
            created_at: Utc::now(),
            params,
            hash: None,
            raw_signed: None,
            nonce_details: None,
            replacement: None,
            error: None,
            warning: None,
            receipt: None,
            replaced_by: None,
            submitted_at: None,
            retry_count: 0,
            first_retry_block: None,
            history: Vec::new(),
        }
    }

    /// A record reusing the nonce of `original`
    pub fn replacing(original: &TransactionRecord, kind: TxKind, nonce: u64, params: TxParams) -> Self {
        let mut record = Self::new(params);
        record.kind = kind;
        record.replacement = Some(Replacement {
            original_id: original.id,
            nonce,
        });
        record
    }

    pub fn from(&self) -> Address {
        self.params.from
    }

    pub fn nonce(&self) -> Option<u64> {
        self.params.nonce
    }
}
