//! Type definitions shared across the tunnel

use std::collections::BTreeMap;
use std::fmt;

use crypto::{CryptoBackend, CryptoError, SignatureAlgorithm, SigningKeypair};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Header version byte for both the handshake and the data plane
pub const WIRE_VERSION: u8 = 1;

/// Protocol identifier mixed into every handshake transcript
pub const PROTOCOL_ID: &str = "/pq-tunnel/handshake/1";

/// HKDF salt for session key derivation
pub const KDF_SALT: &[u8] = b"pq-tunnel/hkdf/v1";

/// Session identifier chosen by the server during the handshake
pub type SessionId = [u8; 4];

/// The two fixed roles of a tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Listens for handshakes (ground station side)
    Server,
    /// Initiates handshakes (vehicle side)
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fleet-wide pre-shared key used for cheap pre-authentication
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Psk([u8; 32]);

impl Psk {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(s.trim()).map_err(|_| "psk must be a hex string")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "psk must decode to 32 bytes")?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Psk(..)")
    }
}

/// Directional traffic keys derived from one handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for client → server traffic
    pub client_to_server: [u8; 32],
    /// Key for server → client traffic
    pub server_to_client: [u8; 32],
}

impl SessionKeys {
    /// Derive both directions from one HKDF call over the KEM shared secret.
    ///
    /// The first 32 output bytes are client→server, the next 32 server→client.
    pub fn derive(
        shared_secret: &[u8],
        session_id: &SessionId,
        suite_id: &str,
    ) -> Result<Self, CryptoError> {
        let mut info = Vec::with_capacity(session_id.len() + suite_id.len());
        info.extend_from_slice(session_id);
        info.extend_from_slice(suite_id.as_bytes());

        let mut okm = zeroize::Zeroizing::new([0u8; 64]);
        crypto::hashes::hkdf_sha256(KDF_SALT, shared_secret, &info, okm.as_mut_slice())?;

        let mut keys = Self {
            client_to_server: [0u8; 32],
            server_to_client: [0u8; 32],
        };
        keys.client_to_server.copy_from_slice(&okm[..32]);
        keys.server_to_client.copy_from_slice(&okm[32..]);
        Ok(keys)
    }

    /// `(send, receive)` keys as seen from `role`
    pub fn for_role(&self, role: Role) -> (&[u8; 32], &[u8; 32]) {
        match role {
            Role::Client => (&self.client_to_server, &self.server_to_client),
            Role::Server => (&self.server_to_client, &self.client_to_server),
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Server long-term signing keys, one per signature algorithm it can serve
#[derive(Clone, Debug, Default)]
pub struct ServerIdentity {
    keys: BTreeMap<SignatureAlgorithm, SigningKeypair>,
}

impl ServerIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the keypair for its algorithm
    pub fn with_keypair(mut self, keypair: SigningKeypair) -> Self {
        self.keys.insert(keypair.algorithm, keypair);
        self
    }

    /// Deterministically generate keypairs for `algorithms` from a seed
    pub fn generate_deterministic(
        backend: &dyn CryptoBackend,
        seed: &[u8],
        algorithms: &[SignatureAlgorithm],
    ) -> Result<Self, CryptoError> {
        let mut identity = Self::new();
        for alg in algorithms {
            identity = identity.with_keypair(backend.generate_signing_keypair(*alg, Some(seed))?);
        }
        Ok(identity)
    }

    pub fn keypair(&self, algorithm: SignatureAlgorithm) -> Option<&SigningKeypair> {
        self.keys.get(&algorithm)
    }

    pub fn algorithms(&self) -> impl Iterator<Item = SignatureAlgorithm> + '_ {
        self.keys.keys().copied()
    }

    /// Public halves, as a client would pin them
    pub fn pinned_keys(&self) -> PinnedServerKeys {
        self.keys
            .values()
            .fold(PinnedServerKeys::new(), |pinned, kp| {
                pinned.with_key(kp.algorithm, kp.public_key.clone())
            })
    }
}

/// Server public keys pinned by a client
#[derive(Clone, Debug, Default)]
pub struct PinnedServerKeys {
    keys: BTreeMap<SignatureAlgorithm, Vec<u8>>,
}

impl PinnedServerKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, algorithm: SignatureAlgorithm, public_key: Vec<u8>) -> Self {
        self.keys.insert(algorithm, public_key);
        self
    }

    pub fn key(&self, algorithm: SignatureAlgorithm) -> Option<&[u8]> {
        self.keys.get(&algorithm).map(Vec::as_slice)
    }
}

/// Long-term identity material handed to the proxy at start-up
#[derive(Clone, Debug)]
pub enum Identity {
    Server(ServerIdentity),
    Client(PinnedServerKeys),
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Identity::Server(_) => Role::Server,
            Identity::Client(_) => Role::Client,
        }
    }

    /// Whether this identity can take part in a handshake signed with `algorithm`
    pub fn supports(&self, algorithm: SignatureAlgorithm) -> bool {
        match self {
            Identity::Server(identity) => identity.keypair(algorithm).is_some(),
            Identity::Client(pinned) => pinned.key(algorithm).is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::PqBackend;

    #[test]
    fn test_psk_parsing() {
        let hex_key = "11".repeat(32);
        let psk = Psk::from_hex(&hex_key).unwrap();
        assert_eq!(psk.as_bytes(), &[0x11u8; 32]);

        assert!(Psk::from_hex("zz").is_err());
        assert!(Psk::from_hex(&"11".repeat(16)).is_err());
        assert_eq!(format!("{:?}", psk), "Psk(..)");
    }

    #[test]
    fn test_session_keys_are_directional() {
        let keys = SessionKeys::derive(&[7u8; 32], &[1, 2, 3, 4], "ml-kem-768+aesgcm+ml-dsa-65")
            .unwrap();
        assert_ne!(keys.client_to_server, keys.server_to_client);

        let (client_send, client_recv) = keys.for_role(Role::Client);
        let (server_send, server_recv) = keys.for_role(Role::Server);
        assert_eq!(client_send, server_recv);
        assert_eq!(client_recv, server_send);
    }

    #[test]
    fn test_session_keys_bind_session_and_suite() {
        let base = SessionKeys::derive(&[7u8; 32], &[1, 2, 3, 4], "suite-a").unwrap();
        let other_sid = SessionKeys::derive(&[7u8; 32], &[1, 2, 3, 5], "suite-a").unwrap();
        let other_suite = SessionKeys::derive(&[7u8; 32], &[1, 2, 3, 4], "suite-b").unwrap();
        assert_ne!(base.client_to_server, other_sid.client_to_server);
        assert_ne!(base.client_to_server, other_suite.client_to_server);
    }

    #[test]
    fn test_identity_pinning() {
        let backend = PqBackend::new();
        let server = ServerIdentity::generate_deterministic(
            &backend,
            b"identity-test",
            &[SignatureAlgorithm::MlDsa44, SignatureAlgorithm::MlDsa65],
        )
        .unwrap();
        let pinned = server.pinned_keys();

        assert_eq!(
            pinned.key(SignatureAlgorithm::MlDsa65),
            server
                .keypair(SignatureAlgorithm::MlDsa65)
                .map(|kp| kp.public_key.as_slice())
        );
        assert!(pinned.key(SignatureAlgorithm::MlDsa87).is_none());

        let identity = Identity::Client(pinned);
        assert_eq!(identity.role(), Role::Client);
        assert!(identity.supports(SignatureAlgorithm::MlDsa44));
        assert!(!identity.supports(SignatureAlgorithm::MlDsa87));
    }
}
