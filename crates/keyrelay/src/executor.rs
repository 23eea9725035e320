//! Method dispatch for admitted requests.
//!
//! A request's method name and parameters are parsed into a [`Method`]
//! before anything else happens, so malformed input is reported without
//! bothering the approver. Execution itself requires an unlocked wallet.

use crate::error::ExecutionError;
use crate::network::{NetworkResolver, ProviderHandle};
use crate::store::{self, keys, Store};
use crate::wallet::{TransactionParams, WalletSigner};
use alloy::primitives::{Address, U256};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A parsed, validated method call.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// Return the wallet's public address.
    GetAddress,
    /// Sign a transaction without broadcasting it.
    SignTransaction(TransactionParams),
    /// Sign and broadcast a transaction.
    SendTransaction(TransactionParams),
    /// EIP-191 sign a UTF-8 message.
    SignMessage(String),
}

impl Method {
    /// Parses a method name and its positional params.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::MethodNotSupported`] for unknown names and
    /// [`ExecutionError::InvalidParams`] for bad parameters.
    pub fn parse(name: &str, params: &[Value]) -> Result<Self, ExecutionError> {
        match name {
            "get_address" => Ok(Self::GetAddress),
            "sign_transaction" => Ok(Self::SignTransaction(parse_transaction(params)?)),
            "send_transaction" => Ok(Self::SendTransaction(parse_transaction(params)?)),
            "sign_message" => match params.first() {
                Some(Value::String(message)) => Ok(Self::SignMessage(message.clone())),
                _ => Err(ExecutionError::InvalidParams(
                    "Invalid 'message': expected a string as the first parameter".into(),
                )),
            },
            other => Err(ExecutionError::MethodNotSupported(other.to_string())),
        }
    }

    /// Wire name of the method.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetAddress => "get_address",
            Self::SignTransaction(_) => "sign_transaction",
            Self::SendTransaction(_) => "send_transaction",
            Self::SignMessage(_) => "sign_message",
        }
    }

    /// Whether the approver must consent before execution.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        !matches!(self, Self::GetAddress)
    }
}

fn parse_transaction(params: &[Value]) -> Result<TransactionParams, ExecutionError> {
    let Some(Value::Object(fields)) = params.first() else {
        return Err(ExecutionError::InvalidParams(
            "Invalid transaction: expected an object as the first parameter".into(),
        ));
    };

    let to = match fields.get("to") {
        Some(Value::String(to)) if is_address(to) || is_dotted_name(to) => to.clone(),
        Some(other) => {
            return Err(ExecutionError::InvalidParams(format!(
                "Invalid 'to': {other} is not an address or name"
            )))
        }
        None => return Err(ExecutionError::InvalidParams("Invalid 'to': missing".into())),
    };

    Ok(TransactionParams {
        to,
        value: normalize_value(fields.get("value"))?,
        chain_id: parse_chain_id(fields.get("chainId"))?,
        fields: fields.clone(),
    })
}

/// `0x` followed by 40 hex digits; mixed case must carry a valid EIP-55
/// checksum.
#[must_use]
pub fn is_address(input: &str) -> bool {
    let Some(digits) = input.strip_prefix("0x") else {
        return false;
    };
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    let mixed = digits.chars().any(|c| c.is_ascii_uppercase())
        && digits.chars().any(|c| c.is_ascii_lowercase());
    if mixed {
        Address::parse_checksummed(input, None).is_ok()
    } else {
        true
    }
}

/// A dot-separated name such as `alice.eth`: at least two labels, each
/// non-empty and made of alphanumerics, `-` or `_`.
#[must_use]
pub fn is_dotted_name(input: &str) -> bool {
    let labels: Vec<&str> = input.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        })
}

/// Normalizes a transaction `value` to wei. Absent means zero; decimal or
/// `0x` hex strings and non-negative integer numbers are accepted.
///
/// # Errors
///
/// Returns [`ExecutionError::InvalidParams`] naming `'value'` otherwise.
pub fn normalize_value(value: Option<&Value>) -> Result<U256, ExecutionError> {
    let invalid = |raw: &Value| {
        ExecutionError::InvalidParams(format!(
            "Invalid 'value': {raw} is not a non-negative integer amount"
        ))
    };
    match value {
        None | Some(Value::Null) => Ok(U256::ZERO),
        Some(Value::Number(n)) => n.as_u64().map(U256::from).ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(raw @ Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
                return Err(invalid(raw));
            }
            s.parse::<U256>().map_err(|_| invalid(raw))
        }
        Some(raw) => Err(invalid(raw)),
    }
}

fn parse_chain_id(value: Option<&Value>) -> Result<Option<u64>, ExecutionError> {
    let invalid = || ExecutionError::InvalidParams("Invalid 'chainId'".into());
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(invalid),
        Some(Value::String(s)) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse::<u64>(),
            };
            parsed.map(Some).map_err(|_| invalid())
        }
        Some(_) => Err(invalid()),
    }
}

/// Runs parsed methods against the wallet.
pub struct MethodExecutor {
    wallet: Arc<dyn WalletSigner>,
    networks: Arc<dyn NetworkResolver>,
    store: Arc<dyn Store>,
}

impl MethodExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        wallet: Arc<dyn WalletSigner>,
        networks: Arc<dyn NetworkResolver>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            wallet,
            networks,
            store,
        }
    }

    /// Whether the wallet can currently execute anything.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.wallet.is_unlocked()
    }

    /// Executes `method` and returns its JSON result.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError`] if the wallet is locked, no provider is
    /// available for a broadcast, or signing fails.
    pub async fn execute(&self, method: &Method) -> Result<Value, ExecutionError> {
        if !self.wallet.is_unlocked() {
            return Err(ExecutionError::WalletLocked);
        }
        debug!(method = method.name(), "executing");
        match method {
            Method::GetAddress => store::load::<String>(self.store.as_ref(), keys::PUBLIC_ADDRESS)
                .await?
                .map(Value::String)
                .ok_or(ExecutionError::NotInitialized),
            Method::SignMessage(message) => Ok(Value::String(
                self.wallet.sign_message(message.as_bytes()).await?,
            )),
            Method::SignTransaction(tx) => {
                let provider = self.resolve_provider(tx).await;
                Ok(Value::String(
                    self.wallet.sign_transaction(tx, provider.as_ref()).await?,
                ))
            }
            Method::SendTransaction(tx) => {
                let provider = self.resolve_provider(tx).await.ok_or_else(|| {
                    ExecutionError::NoProvider(match tx.chain_id {
                        Some(id) => format!("unknown chain {id}"),
                        None => "no network selected".to_string(),
                    })
                })?;
                Ok(Value::String(
                    self.wallet.send_transaction(tx, &provider).await?,
                ))
            }
        }
    }

    async fn resolve_provider(&self, tx: &TransactionParams) -> Option<ProviderHandle> {
        match tx.chain_id {
            Some(chain_id) => self.networks.resolve_by_chain_id(chain_id).await,
            None => self.networks.resolve_by_selection().await,
        }
    }
}
