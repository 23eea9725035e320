//! Common types and utilities shared across the keyrelay protocol stack.
//!
//! This crate provides:
//! - JSON wire envelope parsing and canonical serialization ([`envelope`])
//! - Ed25519 request signature helpers ([`crypto`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod envelope;
pub mod types;

pub use crypto::CryptoError;
pub use envelope::{Envelope, EnvelopeError, Inbound, RequestId};
pub use types::Pubkey;
