//! Key/value persistence for wallet state.
//!
//! Everything the daemon remembers between runs lives under a handful of
//! string keys: the relay URL, the whitelist, one nonce ledger entry per
//! sender, the approval switch and the pending request record. [`Store`]
//! is the seam; [`MemoryStore`] backs tests and [`FileStore`] backs the
//! daemon with a single JSON object on disk.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};

/// Well-known store keys.
pub mod keys {
    /// Last relay URL passed to `connect`.
    pub const RELAY_URL: &str = "relayUrl";
    /// Array of whitelisted Ed25519 public keys (lower-case hex).
    pub const WHITELIST: &str = "whitelist";
    /// Boolean; when true, approval is granted without prompting.
    pub const AUTO_CONFIRM: &str = "autoConfirm";
    /// The most recent request awaiting approval.
    pub const PENDING_REQUEST: &str = "pendingRequest";
    /// Checksummed Ethereum address of the unlocked wallet.
    pub const PUBLIC_ADDRESS: &str = "publicAddress";
    /// Chain id of the network last selected by the operator.
    pub const SELECTED_NETWORK: &str = "selectedNetwork";

    /// Ledger key holding the last accepted nonce for `pubkey`.
    #[must_use]
    pub fn nonce(pubkey: &str) -> String {
        format!("nonce_{pubkey}")
    }
}

/// Asynchronous string-keyed JSON store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    /// Writes `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    /// Deletes `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Reads and decodes a typed value.
///
/// A value that no longer decodes as `T` is reported as an error rather
/// than silently treated as absent.
///
/// # Errors
///
/// Returns [`StoreError`] if the backend fails or the value does not decode.
pub async fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a typed value.
///
/// # Errors
///
/// Returns [`StoreError`] if encoding or the backend fails.
pub async fn save<T: Serialize + ?Sized>(store: &dyn Store, key: &str, value: &T) -> Result<(), StoreError> {
    store.set(key, serde_json::to_value(value)?).await
}

/// Volatile store used in tests and for throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Store persisted as one JSON object file.
///
/// The whole object is kept in memory and rewritten on every mutation via
/// a temp file and rename, so a crash never leaves a half-written file.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Opens the store at `path`, creating an empty one if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a
    /// JSON object.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&contents)? {
                Value::Object(map) => map,
                _ => anyhow::bail!("store file {} is not a JSON object", path.display()),
            }
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, "{}")?;
            Map::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn save_locked(&self, entries: &Map<String, Value>) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(entries)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.save_locked(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.save_locked(&entries).await
    }
}
