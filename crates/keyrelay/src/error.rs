use keyrelay_common::CryptoError;
use thiserror::Error;

/// Errors from the key/value persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored value could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons an inbound relay request is dropped without a response.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The sender key or signature could not be decoded.
    #[error("malformed credentials: {0}")]
    Credentials(#[from] CryptoError),
    /// The sender is not on the whitelist.
    #[error("sender {0} is not whitelisted")]
    NotWhitelisted(String),
    /// The nonce is missing or not an integer.
    #[error("nonce is not an integer")]
    NonIntegerNonce,
    /// The nonce does not advance the sender's ledger.
    #[error("invalid nonce: expected > {last}, got {got}")]
    StaleNonce {
        /// Last accepted nonce for the sender.
        last: i64,
        /// Nonce carried by the request.
        got: i64,
    },
    /// Ed25519 verification failed.
    #[error("invalid ed25519 signature")]
    BadSignature,
    /// The whitelist or ledger could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of the wallet signing capability.
#[derive(Error, Debug)]
pub enum SignerError {
    /// No key is loaded.
    #[error("wallet is locked")]
    Locked,
    /// The transaction object could not be turned into a signable request.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    /// The recipient is a name this wallet cannot resolve.
    #[error("cannot resolve name '{0}'")]
    UnresolvableName(String),
    /// The signing backend failed.
    #[error("signing failed: {0}")]
    Signing(String),
    /// The RPC provider failed while filling or broadcasting.
    #[error("provider error: {0}")]
    Provider(String),
}

/// Reasons the authentication handshake could not be sent.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// No wallet key is available; retried after unlock.
    #[error("wallet is locked")]
    WalletLocked,
    /// The wallet could not sign the auth payload.
    #[error("auth signing failed: {0}")]
    Signing(#[from] SignerError),
}

/// Failures after a request has been accepted. All of these are answered
/// with a signed error response, except [`ExecutionError::Cancelled`].
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The method name is not in the dispatch table.
    #[error("Method not supported: {0}")]
    MethodNotSupported(String),
    /// Request parameters failed validation.
    #[error("{0}")]
    InvalidParams(String),
    /// The wallet must be unlocked for this method.
    #[error("Wallet Locked. Please unlock to sign.")]
    WalletLocked,
    /// No public address has been stored yet.
    #[error("Wallet not initialized")]
    NotInitialized,
    /// The approver rejected the request.
    #[error("User rejected the request")]
    ApprovalDenied,
    /// Nobody answered the approval prompt in time.
    #[error("Approval request timed out")]
    ApprovalTimedOut,
    /// Another request with the same id is already awaiting approval.
    #[error("Request {0} is already pending approval")]
    DuplicateRequest(String),
    /// The session ended while the request was awaiting approval.
    #[error("Request cancelled: connection closed")]
    Cancelled,
    /// No network provider could be resolved for a broadcast.
    #[error("No provider available: {0}")]
    NoProvider(String),
    /// The signing capability failed.
    #[error("{0}")]
    Signer(#[from] SignerError),
    /// Persistence failed mid-request.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
