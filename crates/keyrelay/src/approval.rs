//! Human approval gate.
//!
//! Every method except `get_address` must be approved before it runs.
//! Each waiting request holds a oneshot resolver keyed by its id; the
//! operator's confirm or reject signal resolves it. Waiting requests time
//! out (rejected) after the configured interval and are cancelled when
//! the connection session that admitted them ends.

use crate::error::{ExecutionError, StoreError};
use crate::store::{self, keys, Store};
use chrono::{DateTime, Utc};
use keyrelay_common::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// A request shown to the operator for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    /// Request id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Raw method params.
    pub params: Vec<Value>,
    /// When the prompt was raised.
    pub created_at: DateTime<Utc>,
}

/// The operator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the request.
    Approve,
    /// Refuse the request.
    Reject,
}

/// How a prompt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Confirmed by the operator.
    Approved,
    /// Rejected by the operator.
    Rejected,
    /// Nobody answered in time.
    TimedOut,
    /// The owning session ended first.
    Cancelled,
}

/// Events published to operator interfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    /// A request is waiting for a decision.
    ApprovalRequested {
        /// The request.
        request: PendingRequest,
    },
    /// A prompt was resolved.
    ApprovalResolved {
        /// Request id.
        id: RequestId,
        /// How it ended.
        outcome: Outcome,
    },
}

/// Tracks requests awaiting the operator.
pub struct ApprovalGate {
    store: Arc<dyn Store>,
    pending: Mutex<HashMap<RequestId, (PendingRequest, oneshot::Sender<Decision>)>>,
    events: broadcast::Sender<UiEvent>,
    timeout: Option<Duration>,
}

impl ApprovalGate {
    /// Creates a gate. A `timeout` of `None` waits indefinitely.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, timeout: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            events,
            timeout,
        }
    }

    /// Subscribes to approval events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    /// Number of live event subscribers.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    /// Whether requests are approved without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the flag cannot be read.
    pub async fn auto_confirm(&self) -> Result<bool, StoreError> {
        Ok(store::load::<bool>(self.store.as_ref(), keys::AUTO_CONFIRM)
            .await?
            .unwrap_or(false))
    }

    /// Persists the auto-confirm flag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the flag cannot be saved.
    pub async fn set_auto_confirm(&self, enabled: bool) -> Result<(), StoreError> {
        info!(enabled, "auto-confirm changed");
        store::save(self.store.as_ref(), keys::AUTO_CONFIRM, &enabled).await
    }

    /// Requests currently awaiting a decision, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> =
            self.lock().values().map(|(request, _)| request.clone()).collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Waits for the operator to approve request `id`.
    ///
    /// Returns immediately when auto-confirm is on.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::ApprovalDenied`] on reject,
    /// [`ExecutionError::ApprovalTimedOut`] on timeout,
    /// [`ExecutionError::Cancelled`] when the session ends, and
    /// [`ExecutionError::DuplicateRequest`] if `id` is already waiting.
    pub async fn request_approval(
        &self,
        id: RequestId,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(), ExecutionError> {
        if self.auto_confirm().await? {
            debug!(id = %id, method, "auto-confirmed");
            return Ok(());
        }

        let request = PendingRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
            created_at: Utc::now(),
        };
        let rx = {
            let mut pending = self.lock();
            if pending.contains_key(&id) {
                return Err(ExecutionError::DuplicateRequest(id.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id.clone(), (request.clone(), tx));
            rx
        };

        if let Err(e) = store::save(self.store.as_ref(), keys::PENDING_REQUEST, &request).await {
            warn!(error = %e, "failed to persist pending request");
        }
        info!(id = %id, method, "approval requested");
        let _ = self.events.send(UiEvent::ApprovalRequested { request });

        let answer = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    self.lock().remove(&id);
                    self.finish(&id, Outcome::TimedOut).await;
                    return Err(ExecutionError::ApprovalTimedOut);
                }
            },
            None => rx.await,
        };

        match answer {
            Ok(Decision::Approve) => {
                self.finish(&id, Outcome::Approved).await;
                Ok(())
            }
            Ok(Decision::Reject) => {
                self.finish(&id, Outcome::Rejected).await;
                Err(ExecutionError::ApprovalDenied)
            }
            Err(_) => {
                self.finish(&id, Outcome::Cancelled).await;
                Err(ExecutionError::Cancelled)
            }
        }
    }

    /// Approves request `id`. Returns `false` if nothing was waiting.
    pub fn confirm(&self, id: &RequestId) -> bool {
        self.resolve(id, Decision::Approve)
    }

    /// Rejects request `id`. Returns `false` if nothing was waiting.
    pub fn reject(&self, id: &RequestId) -> bool {
        self.resolve(id, Decision::Reject)
    }

    /// Delivers `decision` to the waiter for `id`.
    pub fn resolve(&self, id: &RequestId, decision: Decision) -> bool {
        match self.lock().remove(id) {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => {
                warn!(id = %id, ?decision, "no pending request with this id");
                false
            }
        }
    }

    /// Cancels every waiting request. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "cancelling pending approvals");
        }
        drained.len()
    }

    async fn finish(&self, id: &RequestId, outcome: Outcome) {
        debug!(id = %id, ?outcome, "approval resolved");
        match store::load::<PendingRequest>(self.store.as_ref(), keys::PENDING_REQUEST).await {
            Ok(Some(stored)) if &stored.id == id => {
                if let Err(e) = self.store.remove(keys::PENDING_REQUEST).await {
                    warn!(error = %e, "failed to clear pending request");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read pending request"),
        }
        let _ = self.events.send(UiEvent::ApprovalResolved {
            id: id.clone(),
            outcome,
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, (PendingRequest, oneshot::Sender<Decision>)>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("approval lock poisoned, using recovered state");
                poisoned.into_inner()
            }
        }
    }
}
