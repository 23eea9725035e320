//! Whitelist of Ed25519 public keys allowed to send requests.
//!
//! Keys are kept as a sorted array of lower-case hex strings under the
//! `whitelist` store key. The array is re-read on every check so operator
//! edits take effect on the next inbound request.

use crate::error::StoreError;
use crate::store::{self, keys, Store};
use keyrelay_common::crypto::{self, CryptoError};
use std::sync::Arc;
use thiserror::Error;

/// Errors from whitelist edits.
#[derive(Error, Debug)]
pub enum WhitelistError {
    /// The key is not 32 bytes of hex.
    #[error("invalid pubkey: {0}")]
    InvalidPubkey(#[from] CryptoError),
    /// The key is already whitelisted.
    #[error("duplicate pubkey: {0}")]
    Duplicate(String),
    /// The key is not whitelisted.
    #[error("no whitelisted pubkey '{0}'")]
    NotFound(String),
    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Store-backed sender whitelist.
#[derive(Clone)]
pub struct Whitelist {
    store: Arc<dyn Store>,
}

impl Whitelist {
    /// Creates a whitelist view over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns every whitelisted key, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the list cannot be read.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(store::load::<Vec<String>>(self.store.as_ref(), keys::WHITELIST)
            .await?
            .unwrap_or_default())
    }

    /// Returns `true` if `pubkey` is whitelisted. Undecodable keys are never
    /// whitelisted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the list cannot be read.
    pub async fn contains(&self, pubkey: &str) -> Result<bool, StoreError> {
        let Ok(normalized) = crypto::normalize_pubkey(pubkey) else {
            return Ok(false);
        };
        Ok(self.list().await?.contains(&normalized))
    }

    /// Adds `pubkey` and returns its normalized form.
    ///
    /// # Errors
    ///
    /// Returns [`WhitelistError`] if the key is invalid, already present,
    /// or the list cannot be saved.
    pub async fn add(&self, pubkey: &str) -> Result<String, WhitelistError> {
        let normalized = crypto::normalize_pubkey(pubkey)?;
        let mut entries = self.list().await?;
        if entries.contains(&normalized) {
            return Err(WhitelistError::Duplicate(normalized));
        }
        entries.push(normalized.clone());
        entries.sort();
        store::save(self.store.as_ref(), keys::WHITELIST, &entries).await?;
        Ok(normalized)
    }

    /// Removes `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns [`WhitelistError`] if the key is invalid, not present, or the
    /// list cannot be saved.
    pub async fn remove(&self, pubkey: &str) -> Result<(), WhitelistError> {
        let normalized = crypto::normalize_pubkey(pubkey)?;
        let mut entries = self.list().await?;
        let before = entries.len();
        entries.retain(|entry| entry != &normalized);
        if entries.len() == before {
            return Err(WhitelistError::NotFound(normalized));
        }
        store::save(self.store.as_ref(), keys::WHITELIST, &entries).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use std::fs;

    fn whitelist() -> Whitelist {
        Whitelist::new(Arc::new(MemoryStore::new()))
    }

    fn pubkey(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[tokio::test]
    async fn add_and_list_sorted() {
        let wl = whitelist();
        wl.add(&pubkey(0x02)).await.unwrap();
        wl.add(&pubkey(0x01)).await.unwrap();

        assert_eq!(wl.list().await.unwrap(), vec![pubkey(0x01), pubkey(0x02)]);
    }

    #[tokio::test]
    async fn add_normalizes_case_and_prefix() {
        let wl = whitelist();
        let stored = wl.add(&format!("0x{}", "AB".repeat(32))).await.unwrap();
        assert_eq!(stored, "ab".repeat(32));
        assert!(wl.contains(&"Ab".repeat(32)).await.unwrap());
    }

    #[tokio::test]
    async fn add_rejects_duplicate() {
        let wl = whitelist();
        wl.add(&pubkey(0x01)).await.unwrap();
        let err = wl.add(&pubkey(0x01)).await.unwrap_err();
        assert!(matches!(err, WhitelistError::Duplicate(_)));
    }

    #[tokio::test]
    async fn add_rejects_invalid_pubkey() {
        let wl = whitelist();
        let err = wl.add("not-a-key").await.unwrap_err();
        assert!(err.to_string().contains("invalid pubkey"));
        assert!(wl.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_existing_and_missing() {
        let wl = whitelist();
        wl.add(&pubkey(0x01)).await.unwrap();
        wl.remove(&pubkey(0x01)).await.unwrap();
        assert!(!wl.contains(&pubkey(0x01)).await.unwrap());

        let err = wl.remove(&pubkey(0x01)).await.unwrap_err();
        assert!(matches!(err, WhitelistError::NotFound(_)));
    }

    #[tokio::test]
    async fn garbage_is_never_whitelisted() {
        let wl = whitelist();
        assert!(!wl.contains("zz").await.unwrap());
    }

    #[tokio::test]
    async fn survives_file_store_reopen() {
        let dir = std::env::temp_dir().join("keyrelay_whitelist_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reopen.json");
        let _ = fs::remove_file(&path);

        let wl = Whitelist::new(Arc::new(FileStore::open(path.clone()).unwrap()));
        wl.add(&pubkey(0x09)).await.unwrap();
        drop(wl);

        let reopened = Whitelist::new(Arc::new(FileStore::open(path.clone()).unwrap()));
        assert!(reopened.contains(&pubkey(0x09)).await.unwrap());

        let _ = fs::remove_file(&path);
    }
}
