//! Error types for the PQ tunnel

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Handshake aborted
    #[error("handshake error: {0}")]
    Handshake(HandshakeError),

    /// Rekey negotiation failed
    #[error("rekey error: {0}")]
    Rekey(#[from] RekeyError),

    /// Suite identifier could not be resolved
    #[error("suite error: {0}")]
    Suite(#[from] SuiteError),

    /// I/O error on a socket
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sender ran out of sequence numbers for its epoch
    #[error("sequence space exhausted for epoch {epoch}; rekey required")]
    SequenceExhausted { epoch: u32 },

    /// The proxy event loop is no longer running
    #[error("proxy stopped")]
    ProxyStopped,
}

/// Reasons a handshake is aborted. Never retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Server signature did not verify against the pinned key
    #[error("server signature invalid")]
    SignatureInvalid,

    /// Offered suite differs from the locally required one
    #[error("suite mismatch: expected {expected}, got {got}")]
    SuiteMismatch { expected: String, got: String },

    /// Pre-shared-key tag missing or wrong
    #[error("pre-authentication rejected")]
    PreAuthRejected,

    /// Malformed, unexpected or truncated handshake message
    #[error("framing error: {0}")]
    FramingError(String),

    /// Overall handshake deadline exceeded
    #[error("handshake timed out")]
    Timeout,

    /// Primitive failure (bad key, ciphertext, KDF)
    #[error("crypto error: {0}")]
    CryptoError(#[from] crypto::CryptoError),
}

impl From<HandshakeError> for TunnelError {
    fn from(e: HandshakeError) -> Self {
        TunnelError::Handshake(e)
    }
}

/// Reasons a rekey negotiation ends without switching suites.
/// Also carried in `Abort` control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RekeyError {
    /// Handshake for the new suite failed, or the peer refused or went silent
    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    /// Commit was not acknowledged before the deadline
    #[error("commit not acknowledged in time")]
    CommitTimeout,

    /// Target suite unknown, unsupported or lacking an identity key
    #[error("suite unsupported: {0}")]
    SuiteUnsupported(String),

    /// Another negotiation is already in flight
    #[error("a rekey is already in progress")]
    Busy,

    /// Epoch counter cannot advance any further
    #[error("epoch space exhausted")]
    EpochExhausted,
}

/// Suite registry failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuiteError {
    #[error("unknown suite: {0}")]
    Unknown(String),

    #[error("suite {suite} uses {algorithm}, which the crypto backend does not support")]
    Unsupported { suite: String, algorithm: String },

    #[error("suite {suite} pairs a {kem_level} KEM with a {sig_level} signature")]
    LevelMismatch {
        suite: String,
        kem_level: crypto::SecurityLevel,
        sig_level: crypto::SecurityLevel,
    },
}

/// Why a data-plane packet was discarded. Drops are counted, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Error)]
pub enum DropReason {
    #[error("replay detected")]
    ReplayDetected,

    #[error("authentication failed")]
    AuthFailure,

    #[error("malformed header")]
    HeaderMalformed,

    #[error("session or epoch mismatch")]
    EpochMismatch,

    #[error("unexpected source address")]
    SourceMismatch,

    #[error("oversized packet")]
    OversizedPacket,
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
