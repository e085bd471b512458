//! Transaction ledger
//!
//! Records, their lifecycle statuses, and the store that owns them.

pub mod history;
pub mod store;
pub mod types;

pub use history::{FieldChange, HistoryEntry};
pub use store::{LedgerStore, TxFilter};
pub use types::{
    NonceDetails, Replacement, TransactionRecord, TxId, TxKind, TxParams, TxReceipt, TxRequest, TxStatus,
    TxWarning,
};
