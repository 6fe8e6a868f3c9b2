//! Classical AEAD ciphers used on the data plane.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;

use crate::algorithms::AeadAlgorithm;
use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A keyed AEAD instance. Keying happens once, so hot paths reuse it.
pub enum AeadCipher {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    pub fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != algorithm.key_len() {
            return Err(CryptoError::InvalidLength {
                expected: algorithm.key_len(),
                actual: key.len(),
            });
        }
        match algorithm {
            AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(|c| AeadCipher::Aes256Gcm(Box::new(c)))
                .map_err(|_| CryptoError::InvalidKey),
            AeadAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(|c| AeadCipher::ChaCha20Poly1305(Box::new(c)))
                .map_err(|_| CryptoError::InvalidKey),
            AeadAlgorithm::Ascon128a => Err(CryptoError::UnsupportedAlgorithm(algorithm.name())),
        }
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        match self {
            AeadCipher::Aes256Gcm(_) => AeadAlgorithm::Aes256Gcm,
            AeadCipher::ChaCha20Poly1305(_) => AeadAlgorithm::ChaCha20Poly1305,
        }
    }

    /// Returns `ciphertext || tag`.
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let sealed = match self {
            AeadCipher::Aes256Gcm(cipher) => {
                cipher.encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
            }
            AeadCipher::ChaCha20Poly1305(cipher) => {
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        sealed.map_err(|_| CryptoError::EncryptionFailed)
    }

    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::DecryptionFailed("ciphertext shorter than tag".to_string()));
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let opened = match self {
            AeadCipher::Aes256Gcm(cipher) => {
                cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
            }
            AeadCipher::ChaCha20Poly1305(cipher) => {
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        opened.map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

impl core::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_roundtrip_both_algorithms() {
        for alg in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::ChaCha20Poly1305] {
            let cipher = AeadCipher::new(alg, &[7u8; 32]).unwrap();
            let nonce = [1u8; NONCE_LEN];
            let ct = cipher.seal(&nonce, b"header", b"payload").unwrap();
            assert_eq!(ct.len(), b"payload".len() + TAG_LEN);
            assert_eq!(cipher.open(&nonce, b"header", &ct).unwrap(), b"payload");
        }
    }

    #[test]
    fn test_aad_is_authenticated() {
        let cipher = AeadCipher::new(AeadAlgorithm::Aes256Gcm, &[3u8; 32]).unwrap();
        let nonce = [0u8; NONCE_LEN];
        let ct = cipher.seal(&nonce, b"aad-one", b"data").unwrap();
        assert!(cipher.open(&nonce, b"aad-two", &ct).is_err());
    }

    #[test]
    fn test_bad_key_and_unsupported_algorithm() {
        assert_eq!(
            AeadCipher::new(AeadAlgorithm::Aes256Gcm, &[0u8; 16]).unwrap_err(),
            CryptoError::InvalidLength {
                expected: 32,
                actual: 16
            }
        );
        assert_eq!(
            AeadCipher::new(AeadAlgorithm::Ascon128a, &[0u8; 16]).unwrap_err(),
            CryptoError::UnsupportedAlgorithm("ascon128a")
        );
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, &[9u8; 32]).unwrap();
        assert!(cipher.open(&[0u8; NONCE_LEN], b"", &[0u8; 4]).is_err());
    }
}
