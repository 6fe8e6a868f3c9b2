//! ML-DSA (FIPS 204) - REAL Post-Quantum Digital Signatures
//!
//! Wrappers around the `ml-dsa` crate for the 44, 65 and 87 parameter sets.
//! Keys are generated from a 32-byte seed; the full encoded signing key is
//! what callers store and hand back for signing.

use ml_dsa::signature::{Signer, Verifier};
use ml_dsa::{MlDsa44, MlDsa65, MlDsa87, B32};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Hash an arbitrary seed down to the 32-byte `xi` ML-DSA key generation expects.
pub fn derive_xi(label: &[u8], seed: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(seed);
    let mut xi = Zeroizing::new([0u8; 32]);
    xi.copy_from_slice(&hasher.finalize());
    xi
}

macro_rules! ml_dsa_parameter_set {
    ($module:ident, $params:ty, $label:literal, $pk:literal, $sk:literal, $sig:literal, $doc:literal) => {
        #[doc = $doc]
        pub mod $module {
            use super::*;

            pub const PUBLIC_KEY_LEN: usize = $pk;
            pub const SECRET_KEY_LEN: usize = $sk;
            pub const SIGNATURE_LEN: usize = $sig;

            /// Returns `(verifying_key, signing_key)` encodings for the given seed.
            pub fn keypair_from_seed(seed: &[u8]) -> (Vec<u8>, Zeroizing<Vec<u8>>) {
                let xi = derive_xi($label, seed);
                let seed_b32: B32 = (*xi).into();
                let sk = ml_dsa::SigningKey::<$params>::from_seed(&seed_b32);
                let vk = sk.verifying_key();
                (
                    vk.encode().to_vec(),
                    Zeroizing::new(sk.encode().to_vec()),
                )
            }

            pub fn sign(secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
                let sk_bytes: Zeroizing<[u8; SECRET_KEY_LEN]> = Zeroizing::new(
                    secret_key
                        .try_into()
                        .map_err(|_| CryptoError::InvalidLength {
                            expected: SECRET_KEY_LEN,
                            actual: secret_key.len(),
                        })?,
                );
                let sk = ml_dsa::SigningKey::<$params>::decode(&(*sk_bytes).into());
                let sig = sk.sign(message);
                Ok(sig.encode().to_vec())
            }

            /// Malformed keys or signatures verify as `false`.
            pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
                let Ok(pk_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
                    return false;
                };
                let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
                    return false;
                };
                let vk = ml_dsa::VerifyingKey::<$params>::decode(&pk_bytes.into());
                let Some(sig) = ml_dsa::Signature::<$params>::decode(&sig_bytes.into()) else {
                    return false;
                };
                vk.verify(message, &sig).is_ok()
            }
        }
    };
}

ml_dsa_parameter_set!(
    mldsa44,
    MlDsa44,
    b"ml-dsa-44-xi",
    1312,
    2560,
    2420,
    "ML-DSA-44 (category 2, paired with category 1 KEMs)."
);
ml_dsa_parameter_set!(
    mldsa65,
    MlDsa65,
    b"ml-dsa-65-xi",
    1952,
    4032,
    3309,
    "ML-DSA-65 (category 3)."
);
ml_dsa_parameter_set!(
    mldsa87,
    MlDsa87,
    b"ml-dsa-87-xi",
    2592,
    4896,
    4627,
    "ML-DSA-87 (category 5)."
);
