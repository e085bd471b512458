//! Signer backed by a private key held in memory.

use async_trait::async_trait;
use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};

use super::TxSigner;
use crate::config::env_vars;
use crate::ledger::TxParams;

pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    /// Requires: TXPIPE_PRIVATE_KEY
    pub fn from_env() -> Result<Self, String> {
        let private_key = std::env::var(env_vars::PRIVATE_KEY)
            .map_err(|_| format!("{} not set", env_vars::PRIVATE_KEY))?;

        Self::from_private_key(&private_key)
    }

    pub fn from_private_key(private_key: &str) -> Result<Self, String> {
        let key_hex = private_key.trim().strip_prefix("0x").unwrap_or(private_key.trim());

        let key_bytes = hex::decode(key_hex).map_err(|e| format!("Invalid private key hex: {}", e))?;

        let signing_key = SigningKey::from_bytes(key_bytes.as_slice().into())
            .map_err(|e| format!("Invalid private key: {}", e))?;

        Ok(Self {
            wallet: LocalWallet::from(signing_key),
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

#[async_trait]
impl TxSigner for LocalWalletSigner {
    fn accounts(&self) -> Vec<Address> {
        vec![self.wallet.address()]
    }

    async fn sign(&self, params: &TxParams) -> Result<Bytes, String> {
        if params.from != self.wallet.address() {
            return Err(format!("No key for account {:?}", params.from));
        }
        let nonce = params
            .nonce
            .ok_or_else(|| "Cannot sign a transaction without a nonce".to_string())?;

        let typed_tx = params.typed_transaction();
        let signature = self
            .wallet
            .clone()
            .with_chain_id(params.chain_id)
            .sign_transaction(&typed_tx)
            .await
            .map_err(|e| format!("Failed to sign transaction: {}", e))?;

        log::debug!(
            "[Wallet] Signed nonce {} for {:?} on chain {}",
            nonce,
            params.from,
            params.chain_id
        );

        Ok(typed_tx.rlp_signed(&signature))
    }

    fn mode_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    // Hardhat account #0, never use outside tests
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn params(signer: &LocalWalletSigner) -> TxParams {
        TxParams {
            from: signer.address(),
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(1_000),
            gas: U256::from(21_000),
            gas_price: Some(U256::from(1_000_000_000u64)),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            nonce: Some(0),
            chain_id: 1,
            data: None,
        }
    }

    #[test]
    fn test_from_private_key() {
        let signer = LocalWalletSigner::from_private_key(TEST_KEY).unwrap();
        assert_eq!(format!("{:?}", signer.address()), TEST_ADDRESS);
    }

    #[test]
    fn test_from_private_key_no_prefix() {
        let signer = LocalWalletSigner::from_private_key(&TEST_KEY[2..]).unwrap();
        assert_eq!(signer.accounts(), vec![signer.address()]);
        assert_eq!(format!("{:?}", signer.address()), TEST_ADDRESS);
    }

    #[test]
    fn test_invalid_key() {
        assert!(LocalWalletSigner::from_private_key("0xnothex").is_err());
    }

    #[tokio::test]
    async fn test_sign_is_deterministic() {
        let signer = LocalWalletSigner::from_private_key(TEST_KEY).unwrap();
        let a = signer.sign(&params(&signer)).await.unwrap();
        let b = signer.sign(&params(&signer)).await.unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_eip1559_is_type_2() {
        let signer = LocalWalletSigner::from_private_key(TEST_KEY).unwrap();
        let mut params = params(&signer);
        params.gas_price = None;
        params.max_fee_per_gas = Some(U256::from(2_000_000_000u64));
        params.max_priority_fee_per_gas = Some(U256::from(1_000_000_000u64));

        let raw = signer.sign(&params).await.unwrap();
        assert_eq!(raw[0], 0x02);
    }

    #[tokio::test]
    async fn test_nonce_changes_encoding() {
        let signer = LocalWalletSigner::from_private_key(TEST_KEY).unwrap();
        let first = signer.sign(&params(&signer)).await.unwrap();
        let mut next = params(&signer);
        next.nonce = Some(1);
        assert_ne!(first, signer.sign(&next).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_missing_nonce_and_foreign_sender() {
        let signer = LocalWalletSigner::from_private_key(TEST_KEY).unwrap();
        let mut no_nonce = params(&signer);
        no_nonce.nonce = None;
        assert!(signer.sign(&no_nonce).await.is_err());

        let mut foreign = params(&signer);
        foreign.from = Address::repeat_byte(0x99);
        assert!(signer.sign(&foreign).await.is_err());
    }
}
