//! In-memory provider and signer for tests

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

use crate::error::ProviderError;
use crate::ledger::{TransactionRecord, TxParams, TxReceipt};
use crate::rpc::ChainProvider;
use crate::wallet::TxSigner;

pub const DEFAULT_GAS_PRICE: u64 = 1_000_000_000;
pub const DEFAULT_GAS_ESTIMATE: u64 = 51_234;

/// Params of a plain transfer from `Address::repeat_byte(sender)`
pub fn params_from(sender: u8) -> TxParams {
    TxParams {
        from: Address::repeat_byte(sender),
        to: Some(Address::repeat_byte(0xee)),
        value: U256::zero(),
        gas: U256::from(21_000),
        gas_price: Some(U256::from(DEFAULT_GAS_PRICE)),
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        nonce: None,
        chain_id: 1,
        data: None,
    }
}

pub fn record_from(sender: u8) -> TransactionRecord {
    TransactionRecord::new(params_from(sender))
}

pub struct MockProvider {
    nonces: Mutex<HashMap<Address, u64>>,
    gas_price: Mutex<U256>,
    gas_estimate: Mutex<Option<U256>>,
    estimated: Mutex<Vec<TxParams>>,
    receipts: Mutex<HashMap<H256, TxReceipt>>,
    published: Mutex<Vec<Bytes>>,
    publish_attempts: AtomicUsize,
    publish_error: Mutex<Option<String>>,
    fail_nonce: AtomicBool,
    fail_gas_price: AtomicBool,
    fail_receipts: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            gas_price: Mutex::new(U256::from(DEFAULT_GAS_PRICE)),
            gas_estimate: Mutex::new(Some(U256::from(DEFAULT_GAS_ESTIMATE))),
            estimated: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            publish_error: Mutex::new(None),
            fail_nonce: AtomicBool::new(false),
            fail_gas_price: AtomicBool::new(false),
            fail_receipts: AtomicBool::new(false),
        }
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.nonces.lock().insert(address, nonce);
    }

    pub fn set_gas_price(&self, price: U256) {
        *self.gas_price.lock() = price;
    }

    /// `None` makes estimation fail
    pub fn set_gas_estimate(&self, estimate: Option<U256>) {
        *self.gas_estimate.lock() = estimate;
    }

    /// Params passed to `estimate_gas`
    pub fn estimated(&self) -> Vec<TxParams> {
        self.estimated.lock().clone()
    }

    pub fn set_receipt(&self, hash: H256, success: bool) {
        self.receipts.lock().insert(
            hash,
            TxReceipt {
                transaction_hash: hash,
                block_number: Some(1),
                gas_used: Some(U256::from(21_000)),
                success,
            },
        );
    }

    pub fn fail_publish(&self, message: Option<&str>) {
        *self.publish_error.lock() = message.map(str::to_string);
    }

    pub fn fail_nonce(&self, fail: bool) {
        self.fail_nonce.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gas_price(&self, fail: bool) {
        self.fail_gas_price.store(fail, Ordering::SeqCst);
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.fail_receipts.store(fail, Ordering::SeqCst);
    }

    /// Payloads accepted by `publish`
    pub fn published(&self) -> Vec<Bytes> {
        self.published.lock().clone()
    }

    /// Every `publish` call, accepted or not
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn next_nonce(&self, address: Address) -> Result<u64, ProviderError> {
        if self.fail_nonce.load(Ordering::SeqCst) {
            return Err(ProviderError::new("nonce lookup failed"));
        }
        Ok(self.nonces.lock().get(&address).copied().unwrap_or(0))
    }

    async fn gas_price(&self) -> Result<U256, ProviderError> {
        if self.fail_gas_price.load(Ordering::SeqCst) {
            return Err(ProviderError::new("gas price unavailable"));
        }
        Ok(*self.gas_price.lock())
    }

    async fn estimate_gas(&self, params: &TxParams) -> Result<U256, ProviderError> {
        self.estimated.lock().push(params.clone());
        let estimate = *self.gas_estimate.lock();
        estimate.ok_or_else(|| ProviderError::new("execution reverted"))
    }

    async fn publish(&self, raw: &Bytes) -> Result<H256, ProviderError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.publish_error.lock().clone() {
            return Err(ProviderError::new(message));
        }
        self.published.lock().push(raw.clone());
        Ok(H256::from(ethers::utils::keccak256(raw)))
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TxReceipt>, ProviderError> {
        if self.fail_receipts.load(Ordering::SeqCst) {
            return Err(ProviderError::new("receipt lookup failed"));
        }
        Ok(self.receipts.lock().get(&hash).cloned())
    }
}

/// Signs by serializing the params, so distinct params give distinct hashes.
pub struct MockSigner {
    address: Address,
    error: Mutex<Option<String>>,
    /// When set, each `sign` consumes one permit before returning
    gate: Option<Arc<Semaphore>>,
    signed_nonces: Mutex<Vec<u64>>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self {
            address: Address::repeat_byte(1),
            error: Mutex::new(None),
            gate: None,
            signed_nonces: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn fail_with(&self, message: Option<&str>) {
        *self.error.lock() = message.map(str::to_string);
    }

    pub fn signed_nonces(&self) -> Vec<u64> {
        self.signed_nonces.lock().clone()
    }
}

#[async_trait]
impl TxSigner for MockSigner {
    fn accounts(&self) -> Vec<Address> {
        vec![self.address]
    }

    async fn sign(&self, params: &TxParams) -> Result<Bytes, String> {
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|e| e.to_string())?;
            permit.forget();
        }
        if let Some(message) = self.error.lock().clone() {
            return Err(message);
        }
        let nonce = params.nonce.ok_or_else(|| "missing nonce".to_string())?;
        self.signed_nonces.lock().push(nonce);
        serde_json::to_vec(params)
            .map(Bytes::from)
            .map_err(|e| e.to_string())
    }

    fn mode_name(&self) -> &'static str {
        "mock"
    }
}
