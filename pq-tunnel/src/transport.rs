//! Handshake transport: drives the handshake engines over a byte stream

use std::sync::Arc;
use std::time::Duration;

use bincode::Options;
use bytes::Bytes;
use crypto::CryptoBackend;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::HandshakeError;
use crate::handshake::{ClientHandshake, HandshakeMessage, HandshakeOutcome, ServerHandshake};
use crate::suites::Suite;
use crate::types::{PinnedServerKeys, Psk, ServerIdentity};

/// Parameters shared by both handshake roles
#[derive(Clone)]
pub struct HandshakeTransport {
    backend: Arc<dyn CryptoBackend>,
    psk: Option<Psk>,
    handshake_timeout: Duration,
    max_message_size: usize,
    verbose_logging: bool,
}

impl HandshakeTransport {
    pub fn new(backend: Arc<dyn CryptoBackend>) -> Self {
        Self {
            backend,
            psk: None,
            handshake_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            verbose_logging: false,
        }
    }

    pub fn with_psk(mut self, psk: Option<Psk>) -> Self {
        self.psk = psk;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the server side on an accepted stream
    pub async fn accept<S>(
        &self,
        stream: S,
        suite: Suite,
        identity: &ServerIdentity,
    ) -> Result<HandshakeOutcome, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        timeout(self.handshake_timeout, self.do_server_handshake(stream, suite, identity))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }

    /// Run the client side on a connected stream
    pub async fn connect<S>(
        &self,
        stream: S,
        suite: Suite,
        pinned: &PinnedServerKeys,
    ) -> Result<HandshakeOutcome, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        timeout(self.handshake_timeout, self.do_client_handshake(stream, suite, pinned))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }

    fn framed<S>(&self, stream: S) -> Framed<S, LengthDelimitedCodec>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(self.max_message_size)
            .new_codec();
        Framed::new(stream, codec)
    }

    fn bincode(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.max_message_size as u64)
    }

    async fn send<S>(
        &self,
        framed: &mut Framed<S, LengthDelimitedCodec>,
        message: &HandshakeMessage,
    ) -> Result<(), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let bytes = self
            .bincode()
            .serialize(message)
            .map_err(|e| HandshakeError::FramingError(e.to_string()))?;
        framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| HandshakeError::FramingError(e.to_string()))
    }

    async fn recv<S>(
        &self,
        framed: &mut Framed<S, LengthDelimitedCodec>,
    ) -> Result<HandshakeMessage, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = framed
            .next()
            .await
            .ok_or_else(|| HandshakeError::FramingError("connection closed".into()))?
            .map_err(|e| HandshakeError::FramingError(e.to_string()))?;
        self.bincode()
            .deserialize(&frame)
            .map_err(|e| HandshakeError::FramingError(e.to_string()))
    }

    async fn do_server_handshake<S>(
        &self,
        stream: S,
        suite: Suite,
        identity: &ServerIdentity,
    ) -> Result<HandshakeOutcome, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = self.framed(stream);
        let mut handshake =
            ServerHandshake::new(self.backend.clone(), suite, identity, self.psk.clone())?;

        // Step 1: Send ServerHello
        let hello = handshake.start()?;
        self.send(&mut framed, &HandshakeMessage::ServerHello(hello))
            .await?;

        if self.verbose_logging {
            tracing::debug!(suite = %handshake.suite(), "Sent ServerHello");
        }

        // Step 2: Receive ClientResponse
        let response = match self.recv(&mut framed).await? {
            HandshakeMessage::ClientResponse(msg) => msg,
            other => {
                return Err(HandshakeError::FramingError(format!(
                    "expected ClientResponse, got {}",
                    other.message_type()
                )))
            }
        };

        if self.verbose_logging {
            tracing::debug!("Received ClientResponse");
        }

        // Step 3: Decapsulate and derive
        let outcome = handshake.finish(response)?;

        tracing::info!(
            session_id = %hex::encode(outcome.session_id),
            suite = %outcome.suite,
            total_ms = outcome.timing.total_ns as f64 / 1e6,
            "PQ handshake complete (server)"
        );

        Ok(outcome)
    }

    async fn do_client_handshake<S>(
        &self,
        stream: S,
        suite: Suite,
        pinned: &PinnedServerKeys,
    ) -> Result<HandshakeOutcome, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = self.framed(stream);
        let mut handshake =
            ClientHandshake::new(self.backend.clone(), suite, pinned, self.psk.clone())?;

        // Step 1: Receive ServerHello
        let hello = match self.recv(&mut framed).await? {
            HandshakeMessage::ServerHello(msg) => msg,
            other => {
                return Err(HandshakeError::FramingError(format!(
                    "expected ServerHello, got {}",
                    other.message_type()
                )))
            }
        };

        if self.verbose_logging {
            tracing::debug!(
                session_id = %hex::encode(hello.session_id),
                suite = %hello.suite_id,
                "Received ServerHello"
            );
        }

        // Step 2: Verify, encapsulate, respond
        let (response, outcome) = handshake.respond(hello)?;
        self.send(&mut framed, &HandshakeMessage::ClientResponse(response))
            .await?;

        if self.verbose_logging {
            tracing::debug!("Sent ClientResponse");
        }

        tracing::info!(
            session_id = %hex::encode(outcome.session_id),
            suite = %outcome.suite,
            total_ms = outcome.timing.total_ns as f64 / 1e6,
            "PQ handshake complete (client)"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suites::SuiteRegistry;
    use crypto::PqBackend;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SUITE: &str = "ml-kem-768+aesgcm+ml-dsa-65";

    fn setup() -> (HandshakeTransport, Suite, ServerIdentity) {
        let backend: Arc<dyn CryptoBackend> = Arc::new(PqBackend::new());
        let suite = SuiteRegistry::new(backend.clone()).resolve(SUITE).unwrap();
        let identity =
            ServerIdentity::generate_deterministic(backend.as_ref(), b"transport-test", &[suite.sig()])
                .unwrap();
        (HandshakeTransport::new(backend), suite, identity)
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (transport, suite, identity) = setup();
        let pinned = identity.pinned_keys();
        let (server_stream, client_stream) = duplex(16 * 1024);

        let (server, client) = tokio::join!(
            transport.accept(server_stream, suite.clone(), &identity),
            transport.connect(client_stream, suite, &pinned)
        );
        let server = server.unwrap();
        let client = client.unwrap();
        assert_eq!(server.session_id, client.session_id);
        assert_eq!(server.keys.server_to_client, client.keys.server_to_client);
    }

    #[tokio::test]
    async fn test_handshake_over_tcp() {
        let (transport, suite, identity) = setup();
        let pinned = identity.pinned_keys();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_transport = transport.clone();
        let server_suite = suite.clone();
        let server_handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            server_transport.accept(socket, server_suite, &identity).await
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let client = transport.connect(socket, suite, &pinned).await.unwrap();
        let server = server_handle.await.unwrap().unwrap();
        assert_eq!(server.keys.client_to_server, client.keys.client_to_server);
    }

    #[tokio::test]
    async fn test_garbage_is_framing_error() {
        let (transport, suite, identity) = setup();
        let (mut raw, client_stream) = duplex(1024);

        let writer = tokio::spawn(async move {
            raw.write_all(&[0, 0, 0, 3, 0xde, 0xad, 0xbe]).await.unwrap();
            raw
        });
        let result = transport
            .connect(client_stream, suite, &identity.pinned_keys())
            .await;
        let _raw = writer.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::FramingError(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (transport, suite, identity) = setup();
        let transport = transport.with_max_message_size(1024);
        let (mut raw, client_stream) = duplex(1024);

        let writer = tokio::spawn(async move {
            raw.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();
            raw
        });
        let result = transport
            .connect(client_stream, suite, &identity.pinned_keys())
            .await;
        let _raw = writer.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::FramingError(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        use std::io;
        use std::pin::Pin;
        use std::task::{Context, Poll};

        // A stream that never completes reads (simulates a silent peer)
        struct HangingStream;

        impl AsyncRead for HangingStream {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Pending
            }
        }

        impl AsyncWrite for HangingStream {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Ok(buf.len()))
            }

            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let (transport, suite, identity) = setup();
        let transport = transport.with_timeout(Duration::from_millis(50));

        let client = transport
            .connect(HangingStream, suite.clone(), &identity.pinned_keys())
            .await;
        assert_eq!(client.unwrap_err(), HandshakeError::Timeout);

        let server = transport.accept(HangingStream, suite, &identity).await;
        assert_eq!(server.unwrap_err(), HandshakeError::Timeout);
    }
}
