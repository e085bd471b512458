//! Error types for the transaction pipeline

use serde::{Deserialize, Serialize};

use crate::ledger::{TxId, TxStatus};

/// Error returned by a chain provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Classification of an error persisted on a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Nonce,
    Sign,
    Publish,
    ReceiptFailure,
    Dropped,
    Interrupted,
}

/// An error as stored on a `TransactionRecord`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TxPipelineError {
    #[error("Invalid transaction params: {0}")]
    Validation(String),

    #[error("Failed to allocate nonce for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("{0}")]
    Sign(String),

    #[error("{0}")]
    Publish(String),

    #[error("Transaction {id} reverted: {reason}")]
    ReceiptFailure { id: TxId, reason: String },

    #[error("Transaction {id} dropped: {reason}")]
    Dropped { id: TxId, reason: String },

    #[error("User denied transaction signature.")]
    UserRejected,

    #[error("Transaction {0} not found")]
    NotFound(TxId),

    #[error("Transaction {0} already exists")]
    DuplicateId(TxId),

    #[error("Transaction {id} cannot move from {from} to {to}")]
    InvalidTransition { id: TxId, from: TxStatus, to: TxStatus },

    /// Terminal failure surfaced to a caller awaiting the transaction
    #[error("Transaction {id} failed: {message}")]
    Failed {
        id: TxId,
        kind: ErrorKind,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TxPipelineError {
    /// Convert into the form persisted on a failed record
    pub fn to_recorded(&self) -> RecordedError {
        let kind = match self {
            TxPipelineError::Validation(_) | TxPipelineError::Config(_) => ErrorKind::Validation,
            TxPipelineError::Nonce { .. } => ErrorKind::Nonce,
            TxPipelineError::Sign(_) => ErrorKind::Sign,
            TxPipelineError::ReceiptFailure { .. } => ErrorKind::ReceiptFailure,
            TxPipelineError::Dropped { .. } => ErrorKind::Dropped,
            TxPipelineError::Failed { kind, .. } => *kind,
            _ => ErrorKind::Publish,
        };
        let message = match self {
            TxPipelineError::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RecordedError::new(kind, message)
    }
}

pub type Result<T> = std::result::Result<T, TxPipelineError>;
