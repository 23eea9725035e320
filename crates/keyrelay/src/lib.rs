//! keyrelay daemon: signs wallet requests that arrive over a relay WebSocket.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Operator approval of pending requests.
pub mod approval;
/// CLI parsing and TOML configuration.
pub mod config;
/// Error types for each pipeline stage.
pub mod error;
/// Wallet method parsing and execution.
pub mod executor;
/// Approval, execution, and response signing for admitted requests.
pub mod handler;
/// secp256k1 wallet key generation and loading.
pub mod keypair;
/// Per-sender replay protection.
pub mod ledger;
/// Line-delimited JSON API over TCP/Unix sockets.
pub mod local_api;
/// Known networks and RPC provider selection.
pub mod network;
/// WebSocket relay connection manager.
pub mod relay;
/// Signed response envelopes.
pub mod responder;
/// Persistent key/value storage.
pub mod store;
/// Inbound request authentication.
pub mod verifier;
/// Lockable secp256k1 wallet.
pub mod wallet;
/// Allowed request senders.
pub mod whitelist;
