use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid length: expected {expected} bytes, found {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(&'static str),

    #[error("verification failed")]
    VerificationFailed,

    #[error("encapsulation failed")]
    EncapsulationFailed,

    #[error("decapsulation failed")]
    DecapsulationFailed,

    #[error("invalid key")]
    InvalidKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}
