//! Core type definitions and protocol constants for keyrelay.

/// A 32-byte Ed25519 public key identifying an authorized relay sender.
pub type Pubkey = [u8; 32];

/// Protocol tag of inbound request envelopes signed with Ed25519.
/// Envelopes carrying any other tag are ignored.
pub const REQUEST_PROTOCOL: &str = "ed25519/v1";

/// Protocol tag of outbound response envelopes signed by the wallet key.
pub const RESPONSE_PROTOCOL: &str = "eth/v1";

/// Protocol tag of the last-resort response envelope sent when the wallet
/// key could not sign. Recipients must treat it as informational only.
pub const UNSIGNED_PROTOCOL: &str = "unsigned/v1";

/// Values of the `type` field on control frames.
pub mod message_type {
    /// Client → relay: proof of wallet ownership.
    pub const WALLET_AUTH: &str = "wallet_auth";
    /// Relay → client: authentication accepted.
    pub const AUTH_SUCCESS: &str = "auth_success";
    /// Relay → client: authentication refused.
    pub const AUTH_ERROR: &str = "auth_error";
    /// Heartbeat ping, sent by either side.
    pub const PING: &str = "ping";
    /// Liveness reply.
    pub const PONG: &str = "pong";
}

/// Method name of the legacy, unauthenticated address query.
pub const LEGACY_ADDRESS_METHOD: &str = "get_address";

/// The legacy address query is recognized only with this request id.
pub const LEGACY_ADDRESS_ID: i64 = 0;
