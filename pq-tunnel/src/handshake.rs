//! Signed single-KEM handshake.
//!
//! ```text
//!   server                                         client
//!   ──────                                         ──────
//!   ephemeral (pk, sk) ← KEM.keygen
//!   σ ← Sign(sk_id, H(transcript))
//!   ServerHello{v, suite, sid, pk, nonce, σ, tag_s} ─────►
//!                                                  check tag_s (PSK)
//!                                                  suite == required
//!                                                  Verify(pk_id, σ)
//!                                                  (ct, ss) ← Encaps(pk)
//!               ◄───────────────────── ClientResponse{ct, tag_c}
//!   check tag_c (PSK)
//!   ss ← Decaps(sk, ct)
//!   keys ← HKDF(ss, sid ‖ suite)                   keys ← HKDF(ss, sid ‖ suite)
//! ```
//!
//! The engines here are pure state machines; [`crate::transport`] moves the
//! messages over TCP.

use std::sync::Arc;
use std::time::Instant;

use crypto::{CryptoBackend, CryptoError, KemKeypair, SigningKeypair};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HandshakeError;
use crate::suites::Suite;
use crate::types::{PinnedServerKeys, Psk, ServerIdentity, SessionId, SessionKeys, PROTOCOL_ID, WIRE_VERSION};

const SERVER_TAG_LABEL: &[u8] = b"server";
const CLIENT_TAG_LABEL: &[u8] = b"client";

/// First handshake message, server → client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: u8,
    pub suite_id: String,
    pub session_id: SessionId,
    pub kem_public_key: Vec<u8>,
    pub nonce: [u8; 8],
    pub signature: Vec<u8>,
    /// HMAC over the transcript digest when a PSK is configured
    pub psk_tag: Option<[u8; 32]>,
}

/// Second handshake message, client → server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub ciphertext: Vec<u8>,
    pub psk_tag: Option<[u8; 32]>,
}

/// Envelope for everything sent on the handshake connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    ServerHello(ServerHello),
    ClientResponse(ClientResponse),
}

impl HandshakeMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            HandshakeMessage::ServerHello(_) => "ServerHello",
            HandshakeMessage::ClientResponse(_) => "ClientResponse",
        }
    }
}

/// SHA-256 over length-prefixed fields, seeded with the protocol id
#[derive(Clone)]
pub struct Transcript {
    hasher: Sha256,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let mut transcript = Self {
            hasher: Sha256::new(),
        };
        transcript.append(PROTOCOL_ID.as_bytes());
        transcript
    }

    pub fn append(&mut self, field: &[u8]) {
        self.hasher.update((field.len() as u32).to_be_bytes());
        self.hasher.update(field);
    }

    pub fn digest(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }

    /// Digest of the signed portion of a ServerHello
    pub fn for_server_hello(
        version: u8,
        session_id: &SessionId,
        suite_id: &str,
        kem_public_key: &[u8],
        nonce: &[u8; 8],
    ) -> [u8; 32] {
        let mut transcript = Self::new();
        transcript.append(&[version]);
        transcript.append(session_id);
        transcript.append(suite_id.as_bytes());
        transcript.append(kem_public_key);
        transcript.append(nonce);
        transcript.digest()
    }
}

/// Wall-clock cost of each handshake primitive, in nanoseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeTiming {
    pub kem_keygen_ns: u64,
    pub sign_ns: u64,
    pub verify_ns: u64,
    pub encapsulate_ns: u64,
    pub decapsulate_ns: u64,
    pub kdf_ns: u64,
    pub pre_auth_ns: u64,
    pub total_ns: u64,
}

fn elapsed_ns(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Progress of one handshake attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    SentHello,
    AwaitHello,
    Verified,
    KeyDerived,
    Failed(HandshakeError),
}

/// Result of a completed handshake
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub suite: Suite,
    pub session_id: SessionId,
    pub keys: SessionKeys,
    pub timing: HandshakeTiming,
}

struct ServerPending {
    session_id: SessionId,
    digest: [u8; 32],
    kem: KemKeypair,
}

/// Server half of the handshake
pub struct ServerHandshake {
    backend: Arc<dyn CryptoBackend>,
    suite: Suite,
    signing: SigningKeypair,
    psk: Option<Psk>,
    phase: HandshakePhase,
    pending: Option<ServerPending>,
    timing: HandshakeTiming,
    started: Instant,
}

impl ServerHandshake {
    pub fn new(
        backend: Arc<dyn CryptoBackend>,
        suite: Suite,
        identity: &ServerIdentity,
        psk: Option<Psk>,
    ) -> Result<Self, HandshakeError> {
        let signing = identity
            .keypair(suite.sig())
            .cloned()
            .ok_or(CryptoError::UnsupportedAlgorithm(suite.sig().name()))?;
        Ok(Self {
            backend,
            suite,
            signing,
            psk,
            phase: HandshakePhase::Init,
            pending: None,
            timing: HandshakeTiming::default(),
            started: Instant::now(),
        })
    }

    pub fn phase(&self) -> &HandshakePhase {
        &self.phase
    }

    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    fn fail(&mut self, error: HandshakeError) -> HandshakeError {
        self.phase = HandshakePhase::Failed(error.clone());
        error
    }

    /// Generate the ephemeral KEM key, sign the transcript and build the hello
    pub fn start(&mut self) -> Result<ServerHello, HandshakeError> {
        if self.phase != HandshakePhase::Init {
            return Err(HandshakeError::FramingError("server handshake already started".into()));
        }
        self.started = Instant::now();
        match self.build_hello() {
            Ok(hello) => {
                self.phase = HandshakePhase::SentHello;
                Ok(hello)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn build_hello(&mut self) -> Result<ServerHello, HandshakeError> {
        let mut rng = rand::thread_rng();
        let mut session_id = [0u8; 4];
        rng.fill_bytes(&mut session_id);
        let mut nonce = [0u8; 8];
        rng.fill_bytes(&mut nonce);

        let t = Instant::now();
        let kem = self.backend.generate_keypair(self.suite.kem())?;
        self.timing.kem_keygen_ns = elapsed_ns(t);

        let digest = Transcript::for_server_hello(
            WIRE_VERSION,
            &session_id,
            self.suite.id(),
            &kem.public_key,
            &nonce,
        );

        let t = Instant::now();
        let signature = self
            .backend
            .sign(self.suite.sig(), &self.signing.secret_key, &digest)?;
        self.timing.sign_ns = elapsed_ns(t);

        let psk_tag = match &self.psk {
            Some(psk) => {
                let t = Instant::now();
                let tag = crypto::hashes::hmac_sha256(psk.as_bytes(), &[SERVER_TAG_LABEL, &digest])?;
                self.timing.pre_auth_ns = elapsed_ns(t);
                Some(tag)
            }
            None => None,
        };

        let hello = ServerHello {
            version: WIRE_VERSION,
            suite_id: self.suite.id().to_string(),
            session_id,
            kem_public_key: kem.public_key.clone(),
            nonce,
            signature,
            psk_tag,
        };
        self.pending = Some(ServerPending {
            session_id,
            digest,
            kem,
        });
        Ok(hello)
    }

    /// Check the client's tag, decapsulate and derive session keys
    pub fn finish(&mut self, response: ClientResponse) -> Result<HandshakeOutcome, HandshakeError> {
        if self.phase != HandshakePhase::SentHello {
            return Err(self.fail(HandshakeError::FramingError(
                "ClientResponse before ServerHello".into(),
            )));
        }
        match self.complete(response) {
            Ok(outcome) => {
                self.phase = HandshakePhase::KeyDerived;
                Ok(outcome)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn complete(&mut self, response: ClientResponse) -> Result<HandshakeOutcome, HandshakeError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| HandshakeError::FramingError("no pending server state".into()))?;

        if let Some(psk) = &self.psk {
            let t = Instant::now();
            let tag = response.psk_tag.ok_or(HandshakeError::PreAuthRejected)?;
            crypto::hashes::hmac_sha256_verify(
                psk.as_bytes(),
                &[CLIENT_TAG_LABEL, &pending.digest, &response.ciphertext],
                &tag,
            )
            .map_err(|_| HandshakeError::PreAuthRejected)?;
            self.timing.pre_auth_ns += elapsed_ns(t);
        }

        let t = Instant::now();
        let shared_secret = self.backend.decapsulate(
            self.suite.kem(),
            &pending.kem.secret_key,
            &response.ciphertext,
        )?;
        self.timing.decapsulate_ns = elapsed_ns(t);

        let t = Instant::now();
        let keys = SessionKeys::derive(&shared_secret[..], &pending.session_id, self.suite.id())?;
        self.timing.kdf_ns = elapsed_ns(t);
        self.timing.total_ns = elapsed_ns(self.started);

        Ok(HandshakeOutcome {
            suite: self.suite.clone(),
            session_id: pending.session_id,
            keys,
            timing: self.timing,
        })
    }
}

/// Client half of the handshake
pub struct ClientHandshake {
    backend: Arc<dyn CryptoBackend>,
    suite: Suite,
    server_key: Vec<u8>,
    psk: Option<Psk>,
    phase: HandshakePhase,
    timing: HandshakeTiming,
    started: Instant,
}

impl ClientHandshake {
    pub fn new(
        backend: Arc<dyn CryptoBackend>,
        suite: Suite,
        pinned: &PinnedServerKeys,
        psk: Option<Psk>,
    ) -> Result<Self, HandshakeError> {
        let server_key = pinned
            .key(suite.sig())
            .map(<[u8]>::to_vec)
            .ok_or(CryptoError::UnsupportedAlgorithm(suite.sig().name()))?;
        Ok(Self {
            backend,
            suite,
            server_key,
            psk,
            phase: HandshakePhase::AwaitHello,
            timing: HandshakeTiming::default(),
            started: Instant::now(),
        })
    }

    pub fn phase(&self) -> &HandshakePhase {
        &self.phase
    }

    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    /// Validate the hello and answer it. Fails before any encapsulation if the
    /// PSK tag, suite or signature is wrong.
    pub fn respond(
        &mut self,
        hello: ServerHello,
    ) -> Result<(ClientResponse, HandshakeOutcome), HandshakeError> {
        if self.phase != HandshakePhase::AwaitHello {
            let e = HandshakeError::FramingError("unexpected ServerHello".into());
            self.phase = HandshakePhase::Failed(e.clone());
            return Err(e);
        }
        self.started = Instant::now();
        match self.process(hello) {
            Ok(result) => {
                self.phase = HandshakePhase::KeyDerived;
                Ok(result)
            }
            Err(e) => {
                self.phase = HandshakePhase::Failed(e.clone());
                Err(e)
            }
        }
    }

    fn process(
        &mut self,
        hello: ServerHello,
    ) -> Result<(ClientResponse, HandshakeOutcome), HandshakeError> {
        if hello.version != WIRE_VERSION {
            return Err(HandshakeError::FramingError(format!(
                "unsupported version {}",
                hello.version
            )));
        }

        let digest = Transcript::for_server_hello(
            hello.version,
            &hello.session_id,
            &hello.suite_id,
            &hello.kem_public_key,
            &hello.nonce,
        );

        if let Some(psk) = &self.psk {
            let t = Instant::now();
            let tag = hello.psk_tag.ok_or(HandshakeError::PreAuthRejected)?;
            crypto::hashes::hmac_sha256_verify(psk.as_bytes(), &[SERVER_TAG_LABEL, &digest], &tag)
                .map_err(|_| HandshakeError::PreAuthRejected)?;
            self.timing.pre_auth_ns = elapsed_ns(t);
        }

        if hello.suite_id != self.suite.id() {
            return Err(HandshakeError::SuiteMismatch {
                expected: self.suite.id().to_string(),
                got: hello.suite_id,
            });
        }

        let t = Instant::now();
        let valid = self
            .backend
            .verify(self.suite.sig(), &self.server_key, &digest, &hello.signature);
        self.timing.verify_ns = elapsed_ns(t);
        if !valid {
            return Err(HandshakeError::SignatureInvalid);
        }
        self.phase = HandshakePhase::Verified;

        let t = Instant::now();
        let (ciphertext, shared_secret) = self
            .backend
            .encapsulate(self.suite.kem(), &hello.kem_public_key)?;
        self.timing.encapsulate_ns = elapsed_ns(t);

        let psk_tag = match &self.psk {
            Some(psk) => {
                let t = Instant::now();
                let tag = crypto::hashes::hmac_sha256(
                    psk.as_bytes(),
                    &[CLIENT_TAG_LABEL, &digest, &ciphertext],
                )?;
                self.timing.pre_auth_ns += elapsed_ns(t);
                Some(tag)
            }
            None => None,
        };

        let t = Instant::now();
        let keys = SessionKeys::derive(&shared_secret[..], &hello.session_id, self.suite.id())?;
        self.timing.kdf_ns = elapsed_ns(t);
        self.timing.total_ns = elapsed_ns(self.started);

        Ok((
            ClientResponse {
                ciphertext,
                psk_tag,
            },
            HandshakeOutcome {
                suite: self.suite.clone(),
                session_id: hello.session_id,
                keys,
                timing: self.timing,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suites::SuiteRegistry;
    use crypto::{PqBackend, SignatureAlgorithm};

    const SUITE: &str = "ml-kem-768+aesgcm+ml-dsa-65";

    fn setup(suite_id: &str) -> (Arc<dyn CryptoBackend>, Suite, ServerIdentity) {
        let backend: Arc<dyn CryptoBackend> = Arc::new(PqBackend::new());
        let suite = SuiteRegistry::new(backend.clone()).resolve(suite_id).unwrap();
        let identity = ServerIdentity::generate_deterministic(
            backend.as_ref(),
            b"handshake-unit",
            &[suite.sig()],
        )
        .unwrap();
        (backend, suite, identity)
    }

    #[test]
    fn test_transcript_is_length_prefixed() {
        let mut a = Transcript::new();
        a.append(b"ab");
        a.append(b"c");
        let mut b = Transcript::new();
        b.append(b"a");
        b.append(b"bc");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_full_handshake_agrees() {
        let (backend, suite, identity) = setup(SUITE);
        let mut server =
            ServerHandshake::new(backend.clone(), suite.clone(), &identity, None).unwrap();
        let mut client =
            ClientHandshake::new(backend, suite, &identity.pinned_keys(), None).unwrap();

        let hello = server.start().unwrap();
        assert_eq!(server.phase(), &HandshakePhase::SentHello);
        assert!(hello.psk_tag.is_none());

        let (response, client_out) = client.respond(hello).unwrap();
        let server_out = server.finish(response).unwrap();

        assert_eq!(client_out.session_id, server_out.session_id);
        assert_eq!(client_out.keys.client_to_server, server_out.keys.client_to_server);
        assert_eq!(client_out.keys.server_to_client, server_out.keys.server_to_client);
        assert_eq!(server.phase(), &HandshakePhase::KeyDerived);
        assert_eq!(client.phase(), &HandshakePhase::KeyDerived);
        assert!(server_out.timing.kem_keygen_ns > 0);
        assert!(client_out.timing.encapsulate_ns > 0);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (backend, suite, identity) = setup(SUITE);
        let mut server =
            ServerHandshake::new(backend.clone(), suite.clone(), &identity, None).unwrap();
        let mut client =
            ClientHandshake::new(backend, suite, &identity.pinned_keys(), None).unwrap();

        let mut hello = server.start().unwrap();
        hello.signature[10] ^= 0xff;
        assert_eq!(client.respond(hello).unwrap_err(), HandshakeError::SignatureInvalid);
        // Never reached encapsulation
        assert!(matches!(client.phase(), HandshakePhase::Failed(HandshakeError::SignatureInvalid)));
    }

    #[test]
    fn test_substituted_kem_key_rejected() {
        let (backend, suite, identity) = setup(SUITE);
        let mut server =
            ServerHandshake::new(backend.clone(), suite.clone(), &identity, None).unwrap();
        let mut client =
            ClientHandshake::new(backend.clone(), suite.clone(), &identity.pinned_keys(), None)
                .unwrap();

        let mut hello = server.start().unwrap();
        hello.kem_public_key = backend.generate_keypair(suite.kem()).unwrap().public_key;
        assert_eq!(client.respond(hello).unwrap_err(), HandshakeError::SignatureInvalid);
    }

    #[test]
    fn test_suite_mismatch() {
        let (backend, suite, identity) = setup(SUITE);
        let other = SuiteRegistry::new(backend.clone())
            .resolve("ml-kem-768+chacha20poly1305+ml-dsa-65")
            .unwrap();
        let mut server = ServerHandshake::new(backend.clone(), other, &identity, None).unwrap();
        let mut client =
            ClientHandshake::new(backend, suite, &identity.pinned_keys(), None).unwrap();

        let hello = server.start().unwrap();
        assert!(matches!(
            client.respond(hello),
            Err(HandshakeError::SuiteMismatch { expected, got })
                if expected == SUITE && got == "ml-kem-768+chacha20poly1305+ml-dsa-65"
        ));
    }

    #[test]
    fn test_psk_roundtrip_and_rejection() {
        let (backend, suite, identity) = setup(SUITE);
        let psk = Psk::from_bytes([9u8; 32]);

        let mut server = ServerHandshake::new(
            backend.clone(),
            suite.clone(),
            &identity,
            Some(psk.clone()),
        )
        .unwrap();
        let mut client = ClientHandshake::new(
            backend.clone(),
            suite.clone(),
            &identity.pinned_keys(),
            Some(psk.clone()),
        )
        .unwrap();
        let hello = server.start().unwrap();
        assert!(hello.psk_tag.is_some());
        let (response, _) = client.respond(hello).unwrap();
        assert!(server.finish(response).is_ok());

        // Client with a different PSK rejects the server before any PQC
        let mut server =
            ServerHandshake::new(backend.clone(), suite.clone(), &identity, Some(psk.clone()))
                .unwrap();
        let mut client = ClientHandshake::new(
            backend.clone(),
            suite.clone(),
            &identity.pinned_keys(),
            Some(Psk::from_bytes([1u8; 32])),
        )
        .unwrap();
        let hello = server.start().unwrap();
        assert_eq!(client.respond(hello).unwrap_err(), HandshakeError::PreAuthRejected);

        // Server with a PSK refuses a client that sends no tag
        let mut server =
            ServerHandshake::new(backend.clone(), suite.clone(), &identity, Some(psk)).unwrap();
        let mut client =
            ClientHandshake::new(backend, suite, &identity.pinned_keys(), None).unwrap();
        let hello = server.start().unwrap();
        let (response, _) = client.respond(hello).unwrap();
        assert_eq!(server.finish(response).unwrap_err(), HandshakeError::PreAuthRejected);
    }

    #[test]
    fn test_missing_identity_key() {
        let (backend, suite, _) = setup(SUITE);
        let identity = ServerIdentity::generate_deterministic(
            backend.as_ref(),
            b"other",
            &[SignatureAlgorithm::MlDsa44],
        )
        .unwrap();
        assert!(matches!(
            ServerHandshake::new(backend.clone(), suite.clone(), &identity, None),
            Err(HandshakeError::CryptoError(CryptoError::UnsupportedAlgorithm(_)))
        ));
        assert!(ClientHandshake::new(backend, suite, &identity.pinned_keys(), None).is_err());
    }

    #[test]
    fn test_finish_before_start() {
        let (backend, suite, identity) = setup(SUITE);
        let mut server = ServerHandshake::new(backend, suite, &identity, None).unwrap();
        let response = ClientResponse {
            ciphertext: vec![0u8; 1088],
            psk_tag: None,
        };
        assert!(matches!(
            server.finish(response),
            Err(HandshakeError::FramingError(_))
        ));
    }
}
