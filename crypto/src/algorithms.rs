//! Algorithm identifiers for every primitive family the tunnel knows about.
//!
//! The catalogue is wider than what [`crate::backend::PqBackend`] implements:
//! code-based KEMs, Falcon and SPHINCS+ are named here so suite strings that
//! mention them parse, and the registry can report them as unsupported
//! instead of unknown.

use core::fmt;

/// NIST post-quantum security category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecurityLevel {
    L1 = 1,
    L3 = 3,
    L5 = 5,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", *self as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KemAlgorithm {
    MlKem512,
    MlKem768,
    MlKem1024,
    ClassicMcEliece348864,
    ClassicMcEliece460896,
    ClassicMcEliece8192128,
    Hqc128,
    Hqc192,
    Hqc256,
}

impl KemAlgorithm {
    pub const ALL: [KemAlgorithm; 9] = [
        KemAlgorithm::MlKem512,
        KemAlgorithm::MlKem768,
        KemAlgorithm::MlKem1024,
        KemAlgorithm::ClassicMcEliece348864,
        KemAlgorithm::ClassicMcEliece460896,
        KemAlgorithm::ClassicMcEliece8192128,
        KemAlgorithm::Hqc128,
        KemAlgorithm::Hqc192,
        KemAlgorithm::Hqc256,
    ];

    /// Canonical name used inside suite identifiers.
    pub fn name(self) -> &'static str {
        match self {
            KemAlgorithm::MlKem512 => "ml-kem-512",
            KemAlgorithm::MlKem768 => "ml-kem-768",
            KemAlgorithm::MlKem1024 => "ml-kem-1024",
            KemAlgorithm::ClassicMcEliece348864 => "classic-mceliece-348864",
            KemAlgorithm::ClassicMcEliece460896 => "classic-mceliece-460896",
            KemAlgorithm::ClassicMcEliece8192128 => "classic-mceliece-8192128",
            KemAlgorithm::Hqc128 => "hqc-128",
            KemAlgorithm::Hqc192 => "hqc-192",
            KemAlgorithm::Hqc256 => "hqc-256",
        }
    }

    /// Compact token used by the older `cs-<kem>-<aead>-<sig>` identifiers.
    pub fn legacy_token(self) -> &'static str {
        match self {
            KemAlgorithm::MlKem512 => "mlkem512",
            KemAlgorithm::MlKem768 => "mlkem768",
            KemAlgorithm::MlKem1024 => "mlkem1024",
            KemAlgorithm::ClassicMcEliece348864 => "mceliece348864",
            KemAlgorithm::ClassicMcEliece460896 => "mceliece460896",
            KemAlgorithm::ClassicMcEliece8192128 => "mceliece8192128",
            KemAlgorithm::Hqc128 => "hqc128",
            KemAlgorithm::Hqc192 => "hqc192",
            KemAlgorithm::Hqc256 => "hqc256",
        }
    }

    pub fn level(self) -> SecurityLevel {
        match self {
            KemAlgorithm::MlKem512 | KemAlgorithm::ClassicMcEliece348864 | KemAlgorithm::Hqc128 => {
                SecurityLevel::L1
            }
            KemAlgorithm::MlKem768 | KemAlgorithm::ClassicMcEliece460896 | KemAlgorithm::Hqc192 => {
                SecurityLevel::L3
            }
            KemAlgorithm::MlKem1024
            | KemAlgorithm::ClassicMcEliece8192128
            | KemAlgorithm::Hqc256 => SecurityLevel::L5,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name() == name || alg.legacy_token() == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignatureAlgorithm {
    MlDsa44,
    MlDsa65,
    MlDsa87,
    Falcon512,
    Falcon1024,
    SphincsSha2_128s,
    SphincsSha2_256s,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 7] = [
        SignatureAlgorithm::MlDsa44,
        SignatureAlgorithm::MlDsa65,
        SignatureAlgorithm::MlDsa87,
        SignatureAlgorithm::Falcon512,
        SignatureAlgorithm::Falcon1024,
        SignatureAlgorithm::SphincsSha2_128s,
        SignatureAlgorithm::SphincsSha2_256s,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SignatureAlgorithm::MlDsa44 => "ml-dsa-44",
            SignatureAlgorithm::MlDsa65 => "ml-dsa-65",
            SignatureAlgorithm::MlDsa87 => "ml-dsa-87",
            SignatureAlgorithm::Falcon512 => "falcon-512",
            SignatureAlgorithm::Falcon1024 => "falcon-1024",
            SignatureAlgorithm::SphincsSha2_128s => "sphincs-sha2-128s",
            SignatureAlgorithm::SphincsSha2_256s => "sphincs-sha2-256s",
        }
    }

    pub fn legacy_token(self) -> &'static str {
        match self {
            SignatureAlgorithm::MlDsa44 => "mldsa44",
            SignatureAlgorithm::MlDsa65 => "mldsa65",
            SignatureAlgorithm::MlDsa87 => "mldsa87",
            SignatureAlgorithm::Falcon512 => "falcon512",
            SignatureAlgorithm::Falcon1024 => "falcon1024",
            SignatureAlgorithm::SphincsSha2_128s => "sphincs128s",
            SignatureAlgorithm::SphincsSha2_256s => "sphincs256s",
        }
    }

    pub fn level(self) -> SecurityLevel {
        match self {
            SignatureAlgorithm::MlDsa44
            | SignatureAlgorithm::Falcon512
            | SignatureAlgorithm::SphincsSha2_128s => SecurityLevel::L1,
            SignatureAlgorithm::MlDsa65 => SecurityLevel::L3,
            SignatureAlgorithm::MlDsa87
            | SignatureAlgorithm::Falcon1024
            | SignatureAlgorithm::SphincsSha2_256s => SecurityLevel::L5,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name() == name || alg.legacy_token() == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AeadAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
    Ascon128a,
}

impl AeadAlgorithm {
    pub const ALL: [AeadAlgorithm; 3] = [
        AeadAlgorithm::Aes256Gcm,
        AeadAlgorithm::ChaCha20Poly1305,
        AeadAlgorithm::Ascon128a,
    ];

    /// AEAD tokens have no separate legacy form.
    pub fn name(self) -> &'static str {
        match self {
            AeadAlgorithm::Aes256Gcm => "aesgcm",
            AeadAlgorithm::ChaCha20Poly1305 => "chacha20poly1305",
            AeadAlgorithm::Ascon128a => "ascon128a",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            AeadAlgorithm::Aes256Gcm | AeadAlgorithm::ChaCha20Poly1305 => 32,
            AeadAlgorithm::Ascon128a => 16,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }
}

impl fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_lookup() {
        for kem in KemAlgorithm::ALL {
            assert_eq!(KemAlgorithm::from_name(kem.name()), Some(kem));
            assert_eq!(KemAlgorithm::from_name(kem.legacy_token()), Some(kem));
        }
        for sig in SignatureAlgorithm::ALL {
            assert_eq!(SignatureAlgorithm::from_name(sig.name()), Some(sig));
            assert_eq!(SignatureAlgorithm::from_name(sig.legacy_token()), Some(sig));
        }
        for aead in AeadAlgorithm::ALL {
            assert_eq!(AeadAlgorithm::from_name(aead.name()), Some(aead));
        }
    }

    #[test]
    fn levels_follow_nist_categories() {
        assert_eq!(KemAlgorithm::MlKem512.level(), SecurityLevel::L1);
        assert_eq!(KemAlgorithm::MlKem768.level(), SecurityLevel::L3);
        assert_eq!(KemAlgorithm::MlKem1024.level(), SecurityLevel::L5);
        assert_eq!(SignatureAlgorithm::MlDsa65.level(), SecurityLevel::L3);
        assert_eq!(SignatureAlgorithm::Falcon1024.level(), SecurityLevel::L5);
        assert_eq!(SecurityLevel::L3.to_string(), "L3");
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(KemAlgorithm::from_name("kyber768"), None);
        assert_eq!(SignatureAlgorithm::from_name("ML-DSA-65"), None);
        assert_eq!(AeadAlgorithm::from_name("aes"), None);
    }
}
