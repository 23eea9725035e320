//! Per-sender nonce ledger.
//!
//! Each sender's last accepted nonce is stored under `nonce_<pubkey>`; a
//! sender that has never been seen starts at [`NO_NONCE`]. Check and
//! commit happen under one lock so two requests from the same sender can
//! never both pass with the same nonce.

use crate::error::{StoreError, ValidationError};
use crate::store::{self, keys, Store};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Ledger baseline for a sender with no accepted request.
pub const NO_NONCE: i64 = -1;

/// Strictly increasing nonce record per sender public key.
pub struct NonceLedger {
    store: Arc<dyn Store>,
    commit: Mutex<()>,
}

impl NonceLedger {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            commit: Mutex::new(()),
        }
    }

    /// Last accepted nonce for `pubkey`, or [`NO_NONCE`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the entry cannot be read.
    pub async fn last(&self, pubkey: &str) -> Result<i64, StoreError> {
        Ok(store::load::<i64>(self.store.as_ref(), &keys::nonce(pubkey))
            .await?
            .unwrap_or(NO_NONCE))
    }

    /// Records `nonce` for `pubkey` if it exceeds the last accepted one and
    /// `check` passes. Nothing is written on any rejection.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::StaleNonce`] for a non-advancing nonce,
    /// whatever `check` returns, or a store failure.
    pub async fn advance<F>(&self, pubkey: &str, nonce: i64, check: F) -> Result<(), ValidationError>
    where
        F: FnOnce() -> Result<(), ValidationError>,
    {
        let _guard = self.commit.lock().await;
        let last = self.last(pubkey).await?;
        if nonce <= last {
            return Err(ValidationError::StaleNonce { last, got: nonce });
        }
        check()?;
        store::save(self.store.as_ref(), &keys::nonce(pubkey), &nonce).await?;
        debug!(pubkey = %pubkey, nonce, "nonce committed");
        Ok(())
    }
}
