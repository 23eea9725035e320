//! Per-request pipeline after admission: parse, approve, execute, sign.

use crate::approval::ApprovalGate;
use crate::error::ExecutionError;
use crate::executor::{Method, MethodExecutor};
use crate::responder::ResponseSigner;
use keyrelay_common::envelope::{RequestData, ResponseEnvelope};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs admitted requests to a signed response.
pub struct RequestHandler {
    gate: Arc<ApprovalGate>,
    executor: MethodExecutor,
    responder: ResponseSigner,
}

impl RequestHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(gate: Arc<ApprovalGate>, executor: MethodExecutor, responder: ResponseSigner) -> Self {
        Self {
            gate,
            executor,
            responder,
        }
    }

    /// Handles one admitted request. Returns `None` when the request was
    /// cancelled and must not be answered.
    pub async fn handle(&self, data: RequestData) -> Option<ResponseEnvelope> {
        let nonce = data.nonce().unwrap_or_default();
        match self.run(&data).await {
            Ok(result) => {
                info!(id = %data.id, method = %data.method, "request completed");
                Some(self.responder.success(data.id, nonce, result).await)
            }
            Err(ExecutionError::Cancelled) => {
                debug!(id = %data.id, "request cancelled, no response");
                None
            }
            Err(e) => {
                warn!(id = %data.id, method = %data.method, error = %e, "request failed");
                Some(self.responder.failure(data.id, nonce, e.to_string()).await)
            }
        }
    }

    async fn run(&self, data: &RequestData) -> Result<Value, ExecutionError> {
        let method = Method::parse(&data.method, &data.params)?;
        if !self.executor.is_ready() {
            return Err(ExecutionError::WalletLocked);
        }
        if method.requires_approval() {
            self.gate
                .request_approval(data.id.clone(), &data.method, data.params.clone())
                .await?;
        }
        self.executor.execute(&method).await
    }
}
