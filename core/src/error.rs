//! Error types for the swap lifecycle engine.

use thiserror::Error;

/// Result type alias using our [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the swap lifecycle engine.
///
/// Variants are grouped the way the supervisor needs to dispatch on them:
/// validation errors never touch the store, transient errors are retried
/// with backoff before they reach here, and chain-reported failures drive a
/// specific state transition rather than aborting.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-bounds request; no state was written.
    #[error("invalid request: {0}")]
    Validation(String),

    /// An RPC call to the smart chain, Bitcoin node, or Lightning node timed
    /// out or returned a 5xx after exhausting its retry budget.
    #[error("transient I/O error talking to {collaborator}: {source}")]
    Transient {
        collaborator: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// An Ed25519 signature failed verification. Never retried.
    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    /// An authorization signature was structurally valid but expired, or was
    /// produced for the wrong prefix/timeout.
    #[error("authorization expired or invalid: {0}")]
    AuthExpired(String),

    /// The escrow observed on chain does not match our stored record. The
    /// record is quarantined rather than mutated.
    #[error("swap data verification failed for {payment_hash}: {reason}")]
    SwapDataVerification {
        payment_hash: String,
        reason: String,
    },

    /// The chain itself reported a terminal condition for a submitted
    /// transaction (`reverted`) or that it never landed (`not_found`).
    #[error("chain reported {status} for tx {tx_id}")]
    ChainReported { status: String, tx_id: String },

    /// The BTC relay has no header covering the transaction and no
    /// synchronizer is available to catch it up.
    #[error("BTC relay not synced")]
    RelayNotSynced,

    /// A swap record could not be found where one was expected.
    #[error("swap not found: {0}")]
    SwapNotFound(String),

    /// The record is currently leased by another task.
    #[error("record {0} is leased by another task")]
    Leased(String),

    /// Persistence failure. Fatal at startup, logged-and-continue on remove.
    #[error("store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// An unreachable state or missing configuration. The supervisor aborts.
    #[error("programmer error: {0}")]
    Terminal(String),

    /// Generic error with context, for collaborator traits returning
    /// `anyhow::Error` across the FFI-ish boundary.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// `true` for the kinds that §7 classifies as non-retryable and that
    /// must bubble out of any retry wrapper immediately.
    pub fn is_terminal_for_retry(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::SignatureVerification(_)
                | Error::AuthExpired(_)
                | Error::SwapDataVerification { .. }
                | Error::Terminal(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(err.to_string())
    }
}
