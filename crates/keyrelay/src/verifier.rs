//! Admission checks for inbound relay requests.
//!
//! A request is admitted only when its sender is whitelisted, its nonce
//! advances the sender's ledger entry and its Ed25519 signature covers the
//! exact `data` bytes. The ledger is written only after all three pass.

use crate::error::ValidationError;
use crate::ledger::NonceLedger;
use crate::whitelist::Whitelist;
use keyrelay_common::crypto;
use keyrelay_common::Envelope;
use tracing::debug;

/// Whitelist, replay and signature gate.
pub struct Verifier {
    whitelist: Whitelist,
    ledger: NonceLedger,
}

impl Verifier {
    /// Creates a verifier from its two stores.
    #[must_use]
    pub fn new(whitelist: Whitelist, ledger: NonceLedger) -> Self {
        Self { whitelist, ledger }
    }

    /// Access to the underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &NonceLedger {
        &self.ledger
    }

    /// Checks the envelope signature alone. Pure and repeatable.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BadSignature`] on mismatch, or
    /// [`ValidationError::Credentials`] if the key or signature is not hex
    /// of the right length.
    pub fn verify_signature(envelope: &Envelope) -> Result<(), ValidationError> {
        let valid = crypto::verify_request(
            &envelope.auth.pubkey,
            &envelope.signing_bytes(),
            &envelope.auth.signature,
        )?;
        if valid {
            Ok(())
        } else {
            Err(ValidationError::BadSignature)
        }
    }

    /// Runs every admission check and commits the nonce on success.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered; the ledger is
    /// untouched in that case.
    pub async fn admit(&self, envelope: &Envelope) -> Result<(), ValidationError> {
        let pubkey = crypto::normalize_pubkey(&envelope.auth.pubkey)?;
        if !self.whitelist.contains(&pubkey).await? {
            return Err(ValidationError::NotWhitelisted(pubkey));
        }
        let nonce = envelope
            .data
            .nonce()
            .ok_or(ValidationError::NonIntegerNonce)?;
        self.ledger
            .advance(&pubkey, nonce, || Self::verify_signature(envelope))
            .await?;
        debug!(id = %envelope.data.id, method = %envelope.data.method, "request admitted");
        Ok(())
    }
}
