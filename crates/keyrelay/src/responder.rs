//! Signs outbound responses with the wallet key.
//!
//! Response data is serialized canonically, signed EIP-191 style and sent
//! as an `eth/v1` envelope. If the wallet cannot sign, the response goes
//! out as `unsigned/v1` with the signing failure recorded in `error`.

use crate::error::SignerError;
use crate::wallet::WalletSigner;
use keyrelay_common::envelope::{ResponseAuth, ResponseData, ResponseEnvelope};
use keyrelay_common::RequestId;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Builds and signs response envelopes.
#[derive(Clone)]
pub struct ResponseSigner {
    wallet: Arc<dyn WalletSigner>,
}

impl ResponseSigner {
    /// Creates a signer over `wallet`.
    #[must_use]
    pub fn new(wallet: Arc<dyn WalletSigner>) -> Self {
        Self { wallet }
    }

    /// Signed success response.
    pub async fn success(&self, id: RequestId, nonce: i64, result: Value) -> ResponseEnvelope {
        self.sign(ResponseData::success(id, nonce, result)).await
    }

    /// Signed error response.
    pub async fn failure(&self, id: RequestId, nonce: i64, error: impl Into<String>) -> ResponseEnvelope {
        self.sign(ResponseData::failure(id, nonce, error)).await
    }

    /// Signs `data`, falling back to an unsigned envelope on failure.
    pub async fn sign(&self, data: ResponseData) -> ResponseEnvelope {
        match self.authenticate(&data).await {
            Ok(auth) => ResponseEnvelope::signed(data, auth),
            Err(e) => {
                warn!(id = %data.id, error = %e, "response signing failed, sending unsigned");
                let fallback = ResponseData::failure(data.id, data.nonce, format!("Signing failed: {e}"));
                ResponseEnvelope::unsigned(fallback)
            }
        }
    }

    async fn authenticate(&self, data: &ResponseData) -> Result<ResponseAuth, SignerError> {
        let address = self.wallet.address().ok_or(SignerError::Locked)?;
        let signature = self.wallet.sign_message(&data.signing_bytes()).await?;
        Ok(ResponseAuth {
            address: address.to_checksum(None),
            signature,
        })
    }
}
