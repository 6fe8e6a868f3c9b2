//! Cipher suite registry
//!
//! A suite is a `(KEM, signature, AEAD)` triple. The canonical identifier is
//! `<kem>+<aead>+<sig>`, e.g. `ml-kem-768+aesgcm+ml-dsa-65`. The older
//! `cs-<kem>-<aead>-<sig>` form (`cs-mlkem768-aesgcm-mldsa65`) is accepted on
//! input and resolves to the same canonical suite, so peers always compare
//! canonical strings.

use std::fmt;
use std::sync::Arc;

use crypto::{AeadAlgorithm, CryptoBackend, KemAlgorithm, SecurityLevel, SignatureAlgorithm};

use crate::error::SuiteError;

const LEGACY_PREFIX: &str = "cs-";

/// A resolved cipher suite. Immutable once built by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Suite {
    id: String,
    kem: KemAlgorithm,
    sig: SignatureAlgorithm,
    aead: AeadAlgorithm,
    level: SecurityLevel,
}

impl Suite {
    fn new(kem: KemAlgorithm, aead: AeadAlgorithm, sig: SignatureAlgorithm) -> Self {
        Self {
            id: canonical_id(kem, aead, sig),
            kem,
            sig,
            aead,
            level: kem.level(),
        }
    }

    /// Canonical identifier, compared byte-for-byte between peers
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kem(&self) -> KemAlgorithm {
        self.kem
    }

    pub fn sig(&self) -> SignatureAlgorithm {
        self.sig
    }

    pub fn aead(&self) -> AeadAlgorithm {
        self.aead
    }

    pub fn level(&self) -> SecurityLevel {
        self.level
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

pub fn canonical_id(kem: KemAlgorithm, aead: AeadAlgorithm, sig: SignatureAlgorithm) -> String {
    format!("{}+{}+{}", kem.name(), aead.name(), sig.name())
}

fn parse(suite_id: &str) -> Option<(KemAlgorithm, AeadAlgorithm, SignatureAlgorithm)> {
    let parts: Vec<&str> = match suite_id.strip_prefix(LEGACY_PREFIX) {
        Some(rest) => rest.split('-').collect(),
        None => suite_id.split('+').collect(),
    };
    let [kem, aead, sig] = parts.as_slice() else {
        return None;
    };
    Some((
        KemAlgorithm::from_name(kem)?,
        AeadAlgorithm::from_name(aead)?,
        SignatureAlgorithm::from_name(sig)?,
    ))
}

/// Resolves suite identifiers against what the crypto backend can actually run
#[derive(Clone)]
pub struct SuiteRegistry {
    backend: Arc<dyn CryptoBackend>,
    allow_cross_level: bool,
}

impl SuiteRegistry {
    pub fn new(backend: Arc<dyn CryptoBackend>) -> Self {
        Self {
            backend,
            allow_cross_level: false,
        }
    }

    /// Permit suites whose KEM and signature sit at different security levels
    pub fn allow_cross_level(mut self, allow: bool) -> Self {
        self.allow_cross_level = allow;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CryptoBackend> {
        &self.backend
    }

    pub fn resolve(&self, suite_id: &str) -> Result<Suite, SuiteError> {
        let (kem, aead, sig) =
            parse(suite_id).ok_or_else(|| SuiteError::Unknown(suite_id.to_string()))?;
        let suite = Suite::new(kem, aead, sig);

        let unsupported = if !self.backend.supports_kem(kem) {
            Some(kem.name())
        } else if !self.backend.supports_sig(sig) {
            Some(sig.name())
        } else if !self.backend.supports_aead(aead) {
            Some(aead.name())
        } else {
            None
        };
        if let Some(algorithm) = unsupported {
            return Err(SuiteError::Unsupported {
                suite: suite.id,
                algorithm: algorithm.to_string(),
            });
        }

        if !self.allow_cross_level && kem.level() != sig.level() {
            return Err(SuiteError::LevelMismatch {
                suite: suite.id,
                kem_level: kem.level(),
                sig_level: sig.level(),
            });
        }

        Ok(suite)
    }

    /// Every suite `resolve` would accept, ordered by level, KEM, signature, AEAD
    pub fn list_supported(&self) -> Vec<Suite> {
        let mut suites = Vec::new();
        for kem in KemAlgorithm::ALL {
            for sig in SignatureAlgorithm::ALL {
                for aead in AeadAlgorithm::ALL {
                    if let Ok(suite) = self.resolve(&canonical_id(kem, aead, sig)) {
                        suites.push(suite);
                    }
                }
            }
        }
        suites.sort_by(|a, b| {
            (a.level, a.kem, a.sig, a.aead).cmp(&(b.level, b.kem, b.sig, b.aead))
        });
        suites
    }
}

impl fmt::Debug for SuiteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteRegistry")
            .field("allow_cross_level", &self.allow_cross_level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::PqBackend;

    fn registry() -> SuiteRegistry {
        SuiteRegistry::new(Arc::new(PqBackend::new()))
    }

    #[test]
    fn test_resolve_canonical() {
        let suite = registry().resolve("ml-kem-768+aesgcm+ml-dsa-65").unwrap();
        assert_eq!(suite.id(), "ml-kem-768+aesgcm+ml-dsa-65");
        assert_eq!(suite.kem(), KemAlgorithm::MlKem768);
        assert_eq!(suite.sig(), SignatureAlgorithm::MlDsa65);
        assert_eq!(suite.aead(), AeadAlgorithm::Aes256Gcm);
        assert_eq!(suite.level(), SecurityLevel::L3);
    }

    #[test]
    fn test_legacy_alias_resolves_to_canonical() {
        let legacy = registry().resolve("cs-mlkem768-aesgcm-mldsa65").unwrap();
        let canonical = registry().resolve("ml-kem-768+aesgcm+ml-dsa-65").unwrap();
        assert_eq!(legacy, canonical);
        assert_eq!(legacy.id(), "ml-kem-768+aesgcm+ml-dsa-65");
    }

    #[test]
    fn test_unknown_suites() {
        let reg = registry();
        for id in [
            "",
            "ml-kem-768",
            "ml-kem-768+aesgcm",
            "ml-kem-768+aesgcm+ml-dsa-65+extra",
            "kyber768+aesgcm+dilithium3",
            "ML-KEM-768+aesgcm+ml-dsa-65",
            "cs-mlkem768-aesgcm",
        ] {
            assert_eq!(reg.resolve(id), Err(SuiteError::Unknown(id.to_string())), "{id}");
        }
    }

    #[test]
    fn test_unsupported_algorithms() {
        let reg = registry();
        assert!(matches!(
            reg.resolve("hqc-192+aesgcm+ml-dsa-65"),
            Err(SuiteError::Unsupported { algorithm, .. }) if algorithm == "hqc-192"
        ));
        assert!(matches!(
            reg.resolve("ml-kem-1024+aesgcm+falcon-1024"),
            Err(SuiteError::Unsupported { algorithm, .. }) if algorithm == "falcon-1024"
        ));
        assert!(matches!(
            reg.resolve("ml-kem-512+ascon128a+ml-dsa-44"),
            Err(SuiteError::Unsupported { algorithm, .. }) if algorithm == "ascon128a"
        ));
    }

    #[test]
    fn test_cross_level_requires_opt_in() {
        let id = "ml-kem-512+chacha20poly1305+ml-dsa-87";
        assert!(matches!(
            registry().resolve(id),
            Err(SuiteError::LevelMismatch {
                kem_level: SecurityLevel::L1,
                sig_level: SecurityLevel::L5,
                ..
            })
        ));
        let suite = registry().allow_cross_level(true).resolve(id).unwrap();
        assert_eq!(suite.level(), SecurityLevel::L1);
    }

    #[test]
    fn test_list_supported_is_level_consistent() {
        let suites = registry().list_supported();
        // three ML-KEM/ML-DSA pairings times two AEADs
        assert_eq!(suites.len(), 6);
        assert!(suites.iter().all(|s| s.kem().level() == s.sig().level()));
        assert_eq!(suites[0].level(), SecurityLevel::L1);
        assert_eq!(suites[5].level(), SecurityLevel::L5);

        let all = registry().allow_cross_level(true).list_supported();
        assert_eq!(all.len(), 18);
    }
}
