//! Post-quantum primitive backend for the PQ tunnel.
//!
//! - [`ml_kem`]: FIPS 203 key encapsulation (512/768/1024)
//! - [`ml_dsa`]: FIPS 204 signatures (44/65/87)
//! - [`aead`]: AES-256-GCM and ChaCha20-Poly1305
//! - [`hashes`]: SHA-256, HMAC-SHA256 and HKDF-SHA256
//! - [`backend`]: the [`CryptoBackend`] capability interface tying them together

pub mod aead;
pub mod algorithms;
pub mod backend;
pub mod error;
pub mod hashes;
pub mod ml_dsa;
pub mod ml_kem;

pub use algorithms::{AeadAlgorithm, KemAlgorithm, SecurityLevel, SignatureAlgorithm};
pub use backend::{CryptoBackend, KemKeypair, PqBackend, SigningKeypair};
pub use error::CryptoError;
pub use ml_kem::SharedSecret;
