//! keyrelay JSON wire envelopes.
//!
//! Every frame on the relay socket is a JSON text message. Inbound frames
//! are classified by [`Inbound::parse`]; outbound frames are produced by the
//! builder functions in this module.
//!
//! Signatures on both sides cover the *canonical serialization* of the `data`
//! object: compact JSON with keys in wire order. `serde_json` is built with
//! `preserve_order`, so re-serializing a parsed [`Value`] reproduces the
//! sender's key order.

use crate::crypto;
use crate::types::{
    message_type, LEGACY_ADDRESS_ID, LEGACY_ADDRESS_METHOD, REQUEST_PROTOCOL, RESPONSE_PROTOCOL,
    UNSIGNED_PROTOCOL,
};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

/// Message sent to the legacy address query when no address is stored.
pub const WALLET_NOT_INITIALIZED: &str = "Wallet not initialized";

/// Errors that can occur while parsing an inbound frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The frame is not valid JSON.
    #[error("malformed json: {0}")]
    Json(String),
    /// The frame is JSON but not an object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// A required envelope member is absent or null.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// An envelope member has the wrong shape.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Name of the offending member.
        field: &'static str,
        /// Deserializer message.
        reason: String,
    },
}

/// Caller-chosen request identifier, echoed back in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// Any other JSON number (fractional, or beyond `i64`), kept as sent.
    Decimal(serde_json::Number),
    /// String id.
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Decimal(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// The signed body of a relay request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestData {
    /// Request id, echoed in the response.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Positional method parameters.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Replay counter; must be an integer. Kept raw so that a non-integer
    /// nonce is rejected by verification rather than by parsing.
    #[serde(default)]
    pub nonce: Value,
}

impl RequestData {
    /// The nonce, if it is an integer.
    #[must_use]
    pub fn nonce(&self) -> Option<i64> {
        self.nonce.as_i64()
    }
}

/// Sender credentials attached to a relay request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestAuth {
    /// Hex Ed25519 public key of the sender.
    pub pubkey: String,
    /// Hex Ed25519 signature over the canonical `data` bytes.
    pub signature: String,
}

/// A parsed `ed25519/v1` request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Typed view of `data`.
    pub data: RequestData,
    /// Sender credentials.
    pub auth: RequestAuth,
    raw_data: Value,
}

impl Envelope {
    /// The bytes the sender's signature must cover.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.raw_data)
    }

    /// The `data` object exactly as received.
    #[must_use]
    pub fn raw_data(&self) -> &Value {
        &self.raw_data
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Relay heartbeat ping.
    Ping,
    /// Reply to our heartbeat ping.
    Pong,
    /// The relay accepted our `wallet_auth`.
    AuthSuccess {
        /// Free-form server message.
        message: Option<String>,
    },
    /// The relay refused our `wallet_auth`.
    AuthError {
        /// Free-form server message.
        message: Option<String>,
    },
    /// Legacy `{method:"get_address", id:0}` query.
    LegacyAddressQuery {
        /// Id to echo back.
        id: RequestId,
    },
    /// An `ed25519/v1` request envelope.
    Request(Box<Envelope>),
    /// A well-formed frame that is not addressed to this client
    /// (unknown `type`, missing or foreign `protocol`).
    Ignored(String),
}

impl Inbound {
    /// Parses and classifies a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] for frames that are not JSON objects, and
    /// for `ed25519/v1` envelopes whose `data` or `auth` is missing or
    /// malformed.
    ///
    /// # Examples
    ///
    /// ```
    /// use keyrelay_common::Inbound;
    /// assert_eq!(Inbound::parse(r#"{"type":"pong"}"#).unwrap(), Inbound::Pong);
    /// assert!(Inbound::parse("not json").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        if obj.get("method").and_then(Value::as_str) == Some(LEGACY_ADDRESS_METHOD)
            && obj.get("id").and_then(Value::as_i64) == Some(LEGACY_ADDRESS_ID)
        {
            return Ok(Self::LegacyAddressQuery {
                id: RequestId::Number(LEGACY_ADDRESS_ID),
            });
        }

        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return Ok(match kind {
                message_type::PING => Self::Ping,
                message_type::PONG => Self::Pong,
                message_type::AUTH_SUCCESS => Self::AuthSuccess { message },
                message_type::AUTH_ERROR => Self::AuthError { message },
                other => Self::Ignored(format!("unknown type {other}")),
            });
        }

        match obj.get("protocol").and_then(Value::as_str) {
            Some(REQUEST_PROTOCOL) => {}
            Some(other) => return Ok(Self::Ignored(format!("foreign protocol {other}"))),
            None => return Ok(Self::Ignored("no protocol".to_string())),
        }

        let raw_data = take_present(&mut obj, "data")?;
        let raw_auth = take_present(&mut obj, "auth")?;
        let data: RequestData =
            serde_json::from_value(raw_data.clone()).map_err(|e| EnvelopeError::InvalidField {
                field: "data",
                reason: e.to_string(),
            })?;
        let auth: RequestAuth =
            serde_json::from_value(raw_auth).map_err(|e| EnvelopeError::InvalidField {
                field: "auth",
                reason: e.to_string(),
            })?;

        Ok(Self::Request(Box::new(Envelope {
            data,
            auth,
            raw_data,
        })))
    }
}

fn take_present(obj: &mut Map<String, Value>, field: &'static str) -> Result<Value, EnvelopeError> {
    obj.remove(field)
        .filter(|v| !v.is_null())
        .ok_or(EnvelopeError::MissingField(field))
}

/// Canonical byte serialization used for signing: compact JSON, keys in
/// insertion order.
#[must_use]
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Builds a signed `ed25519/v1` request envelope around `data`.
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use keyrelay_common::envelope::signed_request;
/// use keyrelay_common::Inbound;
///
/// let key = SigningKey::from_bytes(&[3u8; 32]);
/// let data = serde_json::json!({"id": 1, "method": "get_address", "params": [], "nonce": 0});
/// let frame = signed_request(&key, &data).to_string();
/// assert!(matches!(Inbound::parse(&frame).unwrap(), Inbound::Request(_)));
/// ```
#[must_use]
pub fn signed_request(signing_key: &SigningKey, data: &Value) -> Value {
    let signature = crypto::sign_request(signing_key, &canonical_bytes(data));
    json!({
        "protocol": REQUEST_PROTOCOL,
        "data": data,
        "auth": {
            "pubkey": hex::encode(signing_key.verifying_key().as_bytes()),
            "signature": signature,
        },
    })
}

/// Identity claim sent to the relay at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Unix time in milliseconds.
    pub timestamp: u64,
    /// Checksummed wallet address.
    pub address: String,
    /// Hex SEC1 uncompressed wallet public key.
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl AuthPayload {
    /// JSON form, keys in wire order.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "timestamp": self.timestamp,
            "address": self.address,
            "publicKey": self.public_key,
        })
    }

    /// The bytes the wallet signs.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.to_value())
    }
}

/// `{type:"wallet_auth", payload, signature}`.
#[must_use]
pub fn wallet_auth_message(payload: &AuthPayload, signature: &str) -> String {
    json!({
        "type": message_type::WALLET_AUTH,
        "payload": payload.to_value(),
        "signature": signature,
    })
    .to_string()
}

/// `{type:"ping"}`.
#[must_use]
pub fn ping_message() -> String {
    json!({ "type": message_type::PING }).to_string()
}

/// `{type:"pong"}`.
#[must_use]
pub fn pong_message() -> String {
    json!({ "type": message_type::PONG }).to_string()
}

/// Reply to the legacy address query.
#[must_use]
pub fn legacy_address_reply(id: &RequestId, address: Option<&str>) -> String {
    let error = if address.is_some() {
        Value::Null
    } else {
        Value::from(WALLET_NOT_INITIALIZED)
    };
    json!({ "id": id, "result": address, "error": error }).to_string()
}

/// Body of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    /// Nonce of the request being answered.
    pub nonce: i64,
    /// Id of the request being answered.
    pub id: RequestId,
    /// Method result on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl ResponseData {
    /// A successful response.
    #[must_use]
    pub fn success(id: RequestId, nonce: i64, result: Value) -> Self {
        Self {
            nonce,
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failure(id: RequestId, nonce: i64, error: impl Into<String>) -> Self {
        Self {
            nonce,
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// JSON form, keys in wire order.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "nonce": self.nonce,
            "id": self.id,
            "result": self.result,
            "error": self.error,
        })
    }

    /// The bytes the wallet signs.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.to_value())
    }
}

/// Wallet credentials on a signed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseAuth {
    /// Checksummed wallet address.
    pub address: String,
    /// `0x`-prefixed 65-byte EIP-191 signature.
    pub signature: String,
}

/// An outbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// `eth/v1` when signed, `unsigned/v1` otherwise.
    pub protocol: String,
    /// Response body.
    pub data: ResponseData,
    /// Present only on signed responses.
    pub auth: Option<ResponseAuth>,
}

impl ResponseEnvelope {
    /// A wallet-signed response.
    #[must_use]
    pub fn signed(data: ResponseData, auth: ResponseAuth) -> Self {
        Self {
            protocol: RESPONSE_PROTOCOL.to_string(),
            data,
            auth: Some(auth),
        }
    }

    /// The unsigned fallback response.
    #[must_use]
    pub fn unsigned(data: ResponseData) -> Self {
        Self {
            protocol: UNSIGNED_PROTOCOL.to_string(),
            data,
            auth: None,
        }
    }

    /// Whether this envelope carries a wallet signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.auth.is_some()
    }

    /// Serializes to a text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        let auth = self
            .auth
            .as_ref()
            .map(|a| json!({ "address": a.address, "signature": a.signature }));
        json!({
            "protocol": self.protocol,
            "data": self.data.to_value(),
            "auth": auth,
        })
        .to_string()
    }
}
