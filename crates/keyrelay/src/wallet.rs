//! Wallet signing capability.
//!
//! [`WalletSigner`] is everything the request pipeline needs from a wallet:
//! lock state, identity, EIP-191 message signatures and transaction
//! signing or broadcasting. [`LocalWallet`] implements it over an in-memory
//! secp256k1 key that can be locked and unlocked at runtime.

use crate::error::SignerError;
use crate::keypair;
use crate::network::ProviderHandle;
use crate::store::{self, keys, Store};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, TxKind, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use k256::ecdsa::VerifyingKey;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// A validated transaction request, ready for signing.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionParams {
    /// Recipient: a hex address or a dotted name.
    pub to: String,
    /// Normalized value in wei.
    pub value: U256,
    /// Chain id, if the request named one.
    pub chain_id: Option<u64>,
    /// The transaction object as received, for the remaining fields.
    pub fields: Map<String, Value>,
}

/// Signing operations backed by a secp256k1 wallet.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Whether a key is currently loaded.
    fn is_unlocked(&self) -> bool;
    /// Address of the loaded key.
    fn address(&self) -> Option<Address>;
    /// Uncompressed public key of the loaded key, `0x`-prefixed hex.
    fn public_key(&self) -> Option<String>;
    /// EIP-191 personal-sign over `message`; returns the `0x` hex signature.
    async fn sign_message(&self, message: &[u8]) -> Result<String, SignerError>;
    /// Signs a transaction and returns the raw encoded bytes as `0x` hex.
    /// Missing fields are filled through `provider` when one is given.
    async fn sign_transaction(
        &self,
        tx: &TransactionParams,
        provider: Option<&ProviderHandle>,
    ) -> Result<String, SignerError>;
    /// Signs and broadcasts a transaction; returns the transaction hash.
    async fn send_transaction(
        &self,
        tx: &TransactionParams,
        provider: &ProviderHandle,
    ) -> Result<String, SignerError>;
}

/// Lockable in-memory wallet.
#[derive(Default)]
pub struct LocalWallet {
    signer: RwLock<Option<PrivateKeySigner>>,
}

impl LocalWallet {
    /// A wallet with no key loaded.
    #[must_use]
    pub fn locked() -> Self {
        Self::default()
    }

    /// A wallet unlocked with `signer`.
    #[must_use]
    pub fn unlocked(signer: PrivateKeySigner) -> Self {
        Self {
            signer: RwLock::new(Some(signer)),
        }
    }

    /// Loads `signer`, replacing any current key.
    pub fn unlock(&self, signer: PrivateKeySigner) {
        info!(address = %signer.address(), "wallet unlocked");
        *self.write() = Some(signer);
    }

    /// Drops the loaded key.
    pub fn lock(&self) {
        if self.write().take().is_some() {
            info!("wallet locked");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<PrivateKeySigner>> {
        match self.signer.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("wallet lock poisoned, using recovered state");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<PrivateKeySigner>> {
        match self.signer.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("wallet lock poisoned, using recovered state");
                poisoned.into_inner()
            }
        }
    }

    fn current(&self) -> Result<PrivateKeySigner, SignerError> {
        self.read().clone().ok_or(SignerError::Locked)
    }
}

/// Loads the key file into `wallet` and records its address under
/// `publicAddress`.
///
/// # Errors
///
/// Returns an error if the key file cannot be loaded or the address cannot
/// be stored.
pub async fn unlock_from_key_file(
    wallet: &LocalWallet,
    store: &dyn Store,
    key_path: &Path,
) -> anyhow::Result<Address> {
    let signer = keypair::load_signer(key_path)?;
    let address = signer.address();
    wallet.unlock(signer);
    store::save(store, keys::PUBLIC_ADDRESS, &address.to_checksum(None)).await?;
    Ok(address)
}

/// Builds an alloy request from validated params, signed by `from`.
fn transaction_request(tx: &TransactionParams, from: Address) -> Result<TransactionRequest, SignerError> {
    let to: Address = tx
        .to
        .parse()
        .map_err(|_| SignerError::UnresolvableName(tx.to.clone()))?;

    let mut fields = tx.fields.clone();
    for key in ["to", "value", "chainId", "from"] {
        fields.remove(key);
    }
    let mut request: TransactionRequest = serde_json::from_value(Value::Object(fields))
        .map_err(|e| SignerError::InvalidTransaction(e.to_string()))?;

    request.from = Some(from);
    request.to = Some(TxKind::Call(to));
    request.value = Some(tx.value);
    if let Some(chain_id) = tx.chain_id {
        request.chain_id = Some(chain_id);
    }
    Ok(request)
}

#[async_trait]
impl WalletSigner for LocalWallet {
    fn is_unlocked(&self) -> bool {
        self.read().is_some()
    }

    fn address(&self) -> Option<Address> {
        self.read().as_ref().map(PrivateKeySigner::address)
    }

    fn public_key(&self) -> Option<String> {
        self.read().as_ref().map(|signer| {
            let key: &VerifyingKey = signer.credential().verifying_key();
            let point = key.to_encoded_point(false);
            format!("0x{}", hex::encode(point.as_bytes()))
        })
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String, SignerError> {
        let signer = self.current()?;
        let signature = signer
            .sign_message_sync(message)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    async fn sign_transaction(
        &self,
        tx: &TransactionParams,
        provider: Option<&ProviderHandle>,
    ) -> Result<String, SignerError> {
        let signer = self.current()?;
        let request = transaction_request(tx, signer.address())?;
        let wallet = EthereumWallet::from(signer);

        let envelope = match provider {
            Some(handle) => {
                debug!(chain_id = handle.chain_id, "filling transaction through provider");
                let provider = ProviderBuilder::new()
                    .wallet(wallet)
                    .connect_http(handle.rpc_url.clone());
                let sendable = provider
                    .fill(request)
                    .await
                    .map_err(|e| SignerError::Provider(e.to_string()))?;
                sendable
                    .as_envelope()
                    .cloned()
                    .ok_or_else(|| SignerError::Signing("provider returned an unsigned transaction".into()))?
            }
            None => <TransactionRequest as TransactionBuilder<Ethereum>>::build(request, &wallet)
                .await
                .map_err(|e| SignerError::InvalidTransaction(e.to_string()))?,
        };

        Ok(format!("0x{}", hex::encode(envelope.encoded_2718())))
    }

    async fn send_transaction(
        &self,
        tx: &TransactionParams,
        provider: &ProviderHandle,
    ) -> Result<String, SignerError> {
        let signer = self.current()?;
        let request = transaction_request(tx, signer.address())?;
        let provider_client = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(provider.rpc_url.clone());
        let pending = provider_client
            .send_transaction(request)
            .await
            .map_err(|e| SignerError::Provider(e.to_string()))?;
        let hash = pending.tx_hash().to_string();
        info!(chain_id = provider.chain_id, tx_hash = %hash, "transaction broadcast");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Signature, B256};
    use serde_json::json;

    fn signer() -> PrivateKeySigner {
        PrivateKeySigner::from_bytes(&B256::repeat_byte(0x11)).unwrap()
    }

    fn params(fields: Value) -> TransactionParams {
        let Value::Object(map) = fields else { panic!("object") };
        TransactionParams {
            to: map["to"].as_str().unwrap().to_string(),
            value: U256::from(1_000u64),
            chain_id: Some(1),
            fields: map,
        }
    }

    #[test]
    fn lock_and_unlock() {
        let wallet = LocalWallet::locked();
        assert!(!wallet.is_unlocked());
        assert!(wallet.address().is_none());

        wallet.unlock(signer());
        assert_eq!(wallet.address(), Some(signer().address()));

        wallet.lock();
        assert!(!wallet.is_unlocked());
    }

    #[test]
    fn public_key_is_uncompressed() {
        let wallet = LocalWallet::unlocked(signer());
        let pk = wallet.public_key().unwrap();
        assert!(pk.starts_with("0x04"));
        assert_eq!(pk.len(), 2 + 130);
    }

    #[tokio::test]
    async fn sign_message_recovers_to_wallet_address() {
        let wallet = LocalWallet::unlocked(signer());
        let sig = wallet.sign_message(b"hello relay").await.unwrap();
        let parsed: Signature = sig.parse().unwrap();
        let recovered = parsed.recover_address_from_msg(b"hello relay").unwrap();
        assert_eq!(recovered, signer().address());
    }

    #[tokio::test]
    async fn unlock_from_key_file_stores_address() {
        use crate::store::MemoryStore;
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("keyrelay_wallet_{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("wallet.key");
        std::fs::write(&key_path, [0x11u8; 32]).unwrap();
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let wallet = LocalWallet::locked();
        let store = MemoryStore::new();
        let address = unlock_from_key_file(&wallet, &store, &key_path).await.unwrap();

        assert_eq!(address, signer().address());
        assert!(wallet.is_unlocked());
        let stored: Option<String> = store::load(&store, keys::PUBLIC_ADDRESS).await.unwrap();
        assert_eq!(stored, Some(address.to_checksum(None)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn locked_wallet_refuses_to_sign() {
        let wallet = LocalWallet::locked();
        assert!(matches!(
            wallet.sign_message(b"x").await,
            Err(SignerError::Locked)
        ));
    }

    #[tokio::test]
    async fn sign_complete_transaction_offline() {
        let wallet = LocalWallet::unlocked(signer());
        let tx = params(json!({
            "to": "0x000000000000000000000000000000000000dEaD",
            "nonce": "0x0",
            "gas": "0x5208",
            "gasPrice": "0x3b9aca00",
        }));
        let raw = wallet.sign_transaction(&tx, None).await.unwrap();
        assert!(raw.starts_with("0x"));
        assert!(raw.len() > 100);
    }

    #[tokio::test]
    async fn incomplete_transaction_without_provider_fails() {
        let wallet = LocalWallet::unlocked(signer());
        let tx = params(json!({"to": "0x000000000000000000000000000000000000dEaD"}));
        assert!(matches!(
            wallet.sign_transaction(&tx, None).await,
            Err(SignerError::InvalidTransaction(_))
        ));
    }

    #[tokio::test]
    async fn dotted_recipient_is_unresolvable() {
        let wallet = LocalWallet::unlocked(signer());
        let tx = params(json!({"to": "vitalik.eth"}));
        assert!(matches!(
            wallet.sign_transaction(&tx, None).await,
            Err(SignerError::UnresolvableName(name)) if name == "vitalik.eth"
        ));
    }
}
