//! Runtime-dispatched capability interface over the primitives in this crate.
//!
//! Everything above this layer names algorithms by id and passes keys around
//! as bytes. [`PqBackend`] is the shipped implementation; tests and
//! alternative providers can implement [`CryptoBackend`] themselves.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::aead::{AeadCipher, NONCE_LEN};
use crate::algorithms::{AeadAlgorithm, KemAlgorithm, SignatureAlgorithm};
use crate::error::CryptoError;
use crate::ml_kem::{self, SharedSecret};
use crate::ml_dsa;

/// Ephemeral KEM keypair.
#[derive(Clone)]
pub struct KemKeypair {
    pub algorithm: KemAlgorithm,
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl core::fmt::Debug for KemKeypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KemKeypair")
            .field("algorithm", &self.algorithm)
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

/// Long-term signing keypair.
#[derive(Clone)]
pub struct SigningKeypair {
    pub algorithm: SignatureAlgorithm,
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl core::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("algorithm", &self.algorithm)
            .field("public_key", &hex::encode(&self.public_key[..self.public_key.len().min(8)]))
            .finish_non_exhaustive()
    }
}

/// Capability interface consumed by the suite registry, handshake and data plane.
///
/// All operations are pure functions of their inputs.
pub trait CryptoBackend: Send + Sync {
    fn supports_kem(&self, kem: KemAlgorithm) -> bool;
    fn supports_sig(&self, sig: SignatureAlgorithm) -> bool;
    fn supports_aead(&self, aead: AeadAlgorithm) -> bool;

    fn generate_keypair(&self, kem: KemAlgorithm) -> Result<KemKeypair, CryptoError>;

    /// Returns `(ciphertext, shared_secret)`.
    fn encapsulate(
        &self,
        kem: KemAlgorithm,
        public_key: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret), CryptoError>;

    fn decapsulate(
        &self,
        kem: KemAlgorithm,
        secret_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SharedSecret, CryptoError>;

    /// Deterministic when `seed` is given, random otherwise.
    fn generate_signing_keypair(
        &self,
        sig: SignatureAlgorithm,
        seed: Option<&[u8]>,
    ) -> Result<SigningKeypair, CryptoError>;

    fn sign(
        &self,
        sig: SignatureAlgorithm,
        secret_key: &[u8],
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// A bad or malformed signature yields `false`, never an error.
    fn verify(
        &self,
        sig: SignatureAlgorithm,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> bool;

    fn aead_encrypt(
        &self,
        aead: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        AeadCipher::new(aead, key)?.seal(nonce, aad, plaintext)
    }

    fn aead_decrypt(
        &self,
        aead: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        AeadCipher::new(aead, key)?.open(nonce, aad, ciphertext)
    }
}

/// ML-KEM, ML-DSA, AES-256-GCM and ChaCha20-Poly1305 backed by RustCrypto.
#[derive(Clone, Copy, Debug, Default)]
pub struct PqBackend;

impl PqBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoBackend for PqBackend {
    fn supports_kem(&self, kem: KemAlgorithm) -> bool {
        matches!(
            kem,
            KemAlgorithm::MlKem512 | KemAlgorithm::MlKem768 | KemAlgorithm::MlKem1024
        )
    }

    fn supports_sig(&self, sig: SignatureAlgorithm) -> bool {
        matches!(
            sig,
            SignatureAlgorithm::MlDsa44 | SignatureAlgorithm::MlDsa65 | SignatureAlgorithm::MlDsa87
        )
    }

    fn supports_aead(&self, aead: AeadAlgorithm) -> bool {
        matches!(
            aead,
            AeadAlgorithm::Aes256Gcm | AeadAlgorithm::ChaCha20Poly1305
        )
    }

    fn generate_keypair(&self, kem: KemAlgorithm) -> Result<KemKeypair, CryptoError> {
        let (public_key, secret_key) = match kem {
            KemAlgorithm::MlKem512 => ml_kem::mlkem512::generate(),
            KemAlgorithm::MlKem768 => ml_kem::mlkem768::generate(),
            KemAlgorithm::MlKem1024 => ml_kem::mlkem1024::generate(),
            other => return Err(CryptoError::UnsupportedAlgorithm(other.name())),
        };
        Ok(KemKeypair {
            algorithm: kem,
            public_key,
            secret_key,
        })
    }

    fn encapsulate(
        &self,
        kem: KemAlgorithm,
        public_key: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
        match kem {
            KemAlgorithm::MlKem512 => ml_kem::mlkem512::encapsulate(public_key),
            KemAlgorithm::MlKem768 => ml_kem::mlkem768::encapsulate(public_key),
            KemAlgorithm::MlKem1024 => ml_kem::mlkem1024::encapsulate(public_key),
            other => Err(CryptoError::UnsupportedAlgorithm(other.name())),
        }
    }

    fn decapsulate(
        &self,
        kem: KemAlgorithm,
        secret_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SharedSecret, CryptoError> {
        match kem {
            KemAlgorithm::MlKem512 => ml_kem::mlkem512::decapsulate(secret_key, ciphertext),
            KemAlgorithm::MlKem768 => ml_kem::mlkem768::decapsulate(secret_key, ciphertext),
            KemAlgorithm::MlKem1024 => ml_kem::mlkem1024::decapsulate(secret_key, ciphertext),
            other => Err(CryptoError::UnsupportedAlgorithm(other.name())),
        }
    }

    fn generate_signing_keypair(
        &self,
        sig: SignatureAlgorithm,
        seed: Option<&[u8]>,
    ) -> Result<SigningKeypair, CryptoError> {
        let mut random_seed = Zeroizing::new([0u8; 32]);
        let seed = match seed {
            Some(seed) => seed,
            None => {
                rand::rngs::OsRng.fill_bytes(&mut random_seed[..]);
                &random_seed[..]
            }
        };
        let (public_key, secret_key) = match sig {
            SignatureAlgorithm::MlDsa44 => ml_dsa::mldsa44::keypair_from_seed(seed),
            SignatureAlgorithm::MlDsa65 => ml_dsa::mldsa65::keypair_from_seed(seed),
            SignatureAlgorithm::MlDsa87 => ml_dsa::mldsa87::keypair_from_seed(seed),
            other => return Err(CryptoError::UnsupportedAlgorithm(other.name())),
        };
        Ok(SigningKeypair {
            algorithm: sig,
            public_key,
            secret_key,
        })
    }

    fn sign(
        &self,
        sig: SignatureAlgorithm,
        secret_key: &[u8],
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match sig {
            SignatureAlgorithm::MlDsa44 => ml_dsa::mldsa44::sign(secret_key, message),
            SignatureAlgorithm::MlDsa65 => ml_dsa::mldsa65::sign(secret_key, message),
            SignatureAlgorithm::MlDsa87 => ml_dsa::mldsa87::sign(secret_key, message),
            other => Err(CryptoError::UnsupportedAlgorithm(other.name())),
        }
    }

    fn verify(
        &self,
        sig: SignatureAlgorithm,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> bool {
        match sig {
            SignatureAlgorithm::MlDsa44 => ml_dsa::mldsa44::verify(public_key, message, signature),
            SignatureAlgorithm::MlDsa65 => ml_dsa::mldsa65::verify(public_key, message, signature),
            SignatureAlgorithm::MlDsa87 => ml_dsa::mldsa87::verify(public_key, message, signature),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kem_roundtrip_for_every_supported_algorithm() {
        let backend = PqBackend::new();
        for kem in KemAlgorithm::ALL.into_iter().filter(|k| backend.supports_kem(*k)) {
            let keypair = backend.generate_keypair(kem).unwrap();
            let (ct, ss) = backend.encapsulate(kem, &keypair.public_key).unwrap();
            let recovered = backend.decapsulate(kem, &keypair.secret_key, &ct).unwrap();
            assert_eq!(*ss, *recovered, "{kem}");
        }
    }

    #[test]
    fn signatures_for_every_supported_algorithm() {
        let backend = PqBackend::new();
        for sig in SignatureAlgorithm::ALL.into_iter().filter(|s| backend.supports_sig(*s)) {
            let keypair = backend.generate_signing_keypair(sig, None).unwrap();
            let signature = backend.sign(sig, &keypair.secret_key, b"transcript").unwrap();
            assert!(backend.verify(sig, &keypair.public_key, b"transcript", &signature));
            assert!(!backend.verify(sig, &keypair.public_key, b"other", &signature));
        }
    }

    #[test]
    fn verify_with_wrong_algorithm_is_false_not_error() {
        let backend = PqBackend::new();
        let keypair = backend
            .generate_signing_keypair(SignatureAlgorithm::MlDsa65, Some(b"seed"))
            .unwrap();
        let signature = backend
            .sign(SignatureAlgorithm::MlDsa65, &keypair.secret_key, b"m")
            .unwrap();
        assert!(!backend.verify(SignatureAlgorithm::MlDsa44, &keypair.public_key, b"m", &signature));
        assert!(!backend.verify(SignatureAlgorithm::Falcon512, &keypair.public_key, b"m", &signature));
    }

    #[test]
    fn unsupported_algorithms_report_their_name() {
        let backend = PqBackend::new();
        assert_eq!(
            backend.generate_keypair(KemAlgorithm::Hqc128).unwrap_err(),
            CryptoError::UnsupportedAlgorithm("hqc-128")
        );
        assert_eq!(
            backend
                .generate_signing_keypair(SignatureAlgorithm::SphincsSha2_128s, None)
                .unwrap_err(),
            CryptoError::UnsupportedAlgorithm("sphincs-sha2-128s")
        );
        assert!(!backend.supports_aead(AeadAlgorithm::Ascon128a));
    }

    #[test]
    fn aead_through_backend() {
        let backend = PqBackend::new();
        let key = [5u8; 32];
        let nonce = [0u8; NONCE_LEN];
        let ct = backend
            .aead_encrypt(AeadAlgorithm::ChaCha20Poly1305, &key, &nonce, b"aad", b"hello")
            .unwrap();
        let pt = backend
            .aead_decrypt(AeadAlgorithm::ChaCha20Poly1305, &key, &nonce, b"aad", &ct)
            .unwrap();
        assert_eq!(pt, b"hello");
    }
}
