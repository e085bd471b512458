//! Transaction signing
//!
//! The pipeline hands fully-populated params (nonce included) to a `TxSigner`
//! and stores the returned wire-encoded transaction for publishing and
//! later resubmission.

mod local_signer;

pub use local_signer::LocalWalletSigner;

use async_trait::async_trait;
use ethers::types::{Address, Bytes};

use crate::ledger::TxParams;

#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Addresses this signer can sign for
    fn accounts(&self) -> Vec<Address>;

    /// Sign and RLP-encode. `params.nonce` is always set.
    async fn sign(&self, params: &TxParams) -> Result<Bytes, String>;

    /// Get the mode name for logging
    fn mode_name(&self) -> &'static str;
}
