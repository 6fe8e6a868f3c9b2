//! The bump-in-the-wire proxy.
//!
//! One task owns every socket and the [`SessionSet`]. Each iteration waits
//! on whichever of these is ready first:
//!
//! - plaintext datagrams from the local application
//! - encrypted datagrams from the peer
//! - handshake connections (server only)
//! - commands from [`ProxyHandle`]
//! - results from background rekey handshakes
//! - the housekeeping tick
//!
//! Only this task encrypts, so sequence numbers never race.

mod counters;
mod rate_limit;

pub use counters::{PrimitiveStats, ProxyCounters, ProxyStatus, StatusHandle};
pub use rate_limit::HandshakeRateLimiter;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::TunnelConfig;
use crate::error::{DropReason, HandshakeError, RekeyError, Result, TunnelError};
use crate::handshake::HandshakeOutcome;
use crate::rekey::{ControlMessage, RekeyAction, RekeyMachine};
use crate::session::{Session, SessionSet};
use crate::suites::{Suite, SuiteRegistry};
use crate::transport::HandshakeTransport;
use crate::types::{Identity, Role};
use crate::wire::{FrameType, FRAME_OVERHEAD};

const COMMAND_QUEUE: usize = 16;
const HANDSHAKE_QUEUE: usize = 4;
const MAX_HANDSHAKE_REPLACEMENTS: u8 = 1;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Sockets the proxy runs on. Bind them yourself with [`ProxySockets::bind`]
/// or hand in pre-bound ones.
#[derive(Debug)]
pub struct ProxySockets {
    /// Receives plaintext from the local application
    pub plaintext_in: UdpSocket,
    /// Sends plaintext to `plaintext_forward`
    pub plaintext_out: UdpSocket,
    /// Carries encrypted frames to and from the peer
    pub encrypted: UdpSocket,
    /// Handshake listener; required for the server role
    pub listener: Option<TcpListener>,
}

impl ProxySockets {
    /// Bind every socket named in `config`
    pub async fn bind(config: &TunnelConfig) -> io::Result<Self> {
        let unspecified = match config.plaintext_listen.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let listener = match config.role {
            Role::Server => Some(TcpListener::bind(config.handshake_addr).await?),
            Role::Client => None,
        };
        Ok(Self {
            plaintext_in: UdpSocket::bind(config.plaintext_listen).await?,
            plaintext_out: UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?,
            encrypted: UdpSocket::bind(config.encrypted_listen).await?,
            listener,
        })
    }
}

/// Outcome of a successful rekey, as reported to the requester
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyReport {
    pub rid: u64,
    pub suite: String,
    pub epoch: u32,
    pub elapsed_ms: u64,
}

type RekeyReply = oneshot::Sender<std::result::Result<RekeyReport, RekeyError>>;

#[derive(Debug)]
enum ProxyCommand {
    PrepareRekey { suite_id: String, reply: RekeyReply },
    Stop,
}

/// Control interface to a running proxy
#[derive(Clone, Debug)]
pub struct ProxyHandle {
    commands: mpsc::Sender<ProxyCommand>,
}

impl ProxyHandle {
    /// Ask the proxy to switch to `suite_id`. Resolves when the negotiation
    /// commits or fails; the tunnel keeps running either way.
    pub async fn prepare_rekey(&self, suite_id: &str) -> Result<RekeyReport> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ProxyCommand::PrepareRekey {
                suite_id: suite_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| TunnelError::ProxyStopped)?;
        rx.await
            .map_err(|_| TunnelError::ProxyStopped)?
            .map_err(TunnelError::from)
    }

    /// Stop the event loop. `start` then returns the final status.
    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(ProxyCommand::Stop)
            .await
            .map_err(|_| TunnelError::ProxyStopped)
    }
}

/// A configured, not-yet-running tunnel endpoint
pub struct TunnelProxy {
    config: TunnelConfig,
    registry: SuiteRegistry,
    identity: Arc<Identity>,
    sockets: ProxySockets,
    status: StatusHandle,
    commands: mpsc::Receiver<ProxyCommand>,
    command_tx: mpsc::Sender<ProxyCommand>,
}

impl TunnelProxy {
    /// Bind the sockets named in `config` and build the proxy
    pub async fn bind(config: TunnelConfig, registry: SuiteRegistry, identity: Identity) -> Result<Self> {
        let sockets = ProxySockets::bind(&config).await?;
        Self::from_sockets(config, registry, identity, sockets)
    }

    pub fn from_sockets(
        config: TunnelConfig,
        registry: SuiteRegistry,
        identity: Identity,
        sockets: ProxySockets,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
        if identity.role() != config.role {
            return Err(TunnelError::InvalidConfig(format!(
                "{} identity given to a {} proxy",
                identity.role(),
                config.role
            )));
        }
        if config.role == Role::Server && sockets.listener.is_none() {
            return Err(TunnelError::InvalidConfig(
                "server role requires a handshake listener".into(),
            ));
        }

        let registry = registry.allow_cross_level(config.allow_cross_level);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        Ok(Self {
            status: StatusHandle::new(config.role),
            config,
            registry,
            identity: Arc::new(identity),
            sockets,
            commands,
            command_tx,
        })
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            commands: self.command_tx.clone(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Establish the first session on `suite_id`, then run until stopped.
    /// Returns the final status.
    pub async fn start(self, suite_id: &str) -> Result<ProxyStatus> {
        let TunnelProxy {
            config,
            registry,
            identity,
            sockets,
            status,
            mut commands,
            command_tx: _,
        } = self;

        let suite = registry.resolve(suite_id)?;
        if !identity.supports(suite.sig()) {
            return Err(TunnelError::InvalidConfig(format!(
                "no identity key for {}",
                suite.sig()
            )));
        }

        tracing::info!(
            role = %config.role,
            suite = %suite,
            encrypted_peer = %config.encrypted_peer,
            "starting tunnel"
        );

        let transport = HandshakeTransport::new(registry.backend().clone())
            .with_psk(config.psk.clone())
            .with_timeout(config.handshake_timeout)
            .with_max_message_size(config.max_handshake_message_size)
            .with_verbose_logging(config.verbose_logging);
        let mut rate_limiter =
            HandshakeRateLimiter::new(config.rate_limit_burst, config.rate_limit_refill_per_sec);

        let outcome = tokio::select! {
            outcome = initial_handshake(
                &config,
                &identity,
                &sockets,
                &status,
                &transport,
                suite,
                &mut rate_limiter,
            ) => outcome?,
            _ = wait_for_stop(&mut commands) => return Err(TunnelError::ProxyStopped),
        };

        let session = Session::from_outcome(
            outcome,
            config.role,
            0,
            config.replay_window,
            config.rekey_sequence_threshold,
        )?;

        let rekey = RekeyMachine::new(
            config.role,
            registry,
            signature_algorithms(&identity),
            config.rekey_timeout,
            config.commit_timeout(),
        )
        .with_revert_window(config.rekey_grace);
        let (handshake_tx, handshake_rx) = mpsc::channel(HANDSHAKE_QUEUE);

        let event_loop = EventLoop {
            ptx_buf: vec![0u8; config.max_plaintext_size + 1],
            enc_buf: vec![0u8; config.max_plaintext_size + FRAME_OVERHEAD + 1],
            transport: transport.with_timeout(config.rekey_timeout),
            config,
            identity,
            sockets,
            status,
            commands,
            commands_open: true,
            sessions: SessionSet::new(session),
            rekey,
            rate_limiter,
            pending: None,
            staged_rid: None,
            waiters: Vec::new(),
            handshake_tx,
            handshake_rx,
            app_peer: None,
            last_auto_rekey: None,
        };
        event_loop.run().await
    }
}

/// Run the first handshake. A failure is returned to the caller, never retried.
async fn initial_handshake(
    config: &TunnelConfig,
    identity: &Identity,
    sockets: &ProxySockets,
    status: &StatusHandle,
    transport: &HandshakeTransport,
    suite: Suite,
    rate_limiter: &mut HandshakeRateLimiter,
) -> Result<HandshakeOutcome> {
    match identity {
        Identity::Server(identity) => {
            let Some(listener) = sockets.listener.as_ref() else {
                return Err(TunnelError::InvalidConfig("no handshake listener".into()));
            };
            let (stream, _) = next_admitted(
                move || listener.accept(),
                |addr| admit_handshake(config, status, rate_limiter, addr),
            )
            .await;
            Ok(transport.accept(stream, suite, identity).await?)
        }
        Identity::Client(pinned) => {
            let stream = connect_within(config.handshake_addr, config.handshake_timeout).await?;
            Ok(transport.connect(stream, suite, pinned).await?)
        }
    }
}

/// Accept until a connection passes `admit`. Accept errors (EMFILE,
/// ECONNABORTED) are logged and retried after a short pause.
async fn next_admitted<A, F>(
    mut accept: A,
    mut admit: impl FnMut(SocketAddr) -> bool,
) -> (TcpStream, SocketAddr)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, addr)) if admit(addr) => return (stream, addr),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "handshake accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Dial the handshake address, giving up after `limit`
async fn connect_within(
    addr: SocketAddr,
    limit: Duration,
) -> std::result::Result<TcpStream, HandshakeError> {
    tokio::time::timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .map_err(|e| HandshakeError::FramingError(e.to_string()))
}

async fn wait_for_stop(commands: &mut mpsc::Receiver<ProxyCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            ProxyCommand::Stop => return,
            ProxyCommand::PrepareRekey { reply, .. } => {
                let _ = reply.send(Err(RekeyError::Busy));
            }
        }
    }
    // Every handle dropped; keep waiting on the handshake alone
    std::future::pending::<()>().await
}

fn signature_algorithms(identity: &Identity) -> Vec<crypto::SignatureAlgorithm> {
    crypto::SignatureAlgorithm::ALL
        .into_iter()
        .filter(|alg| identity.supports(*alg))
        .collect()
}

/// Rate-limit and source-check an incoming handshake connection before any PQC work
fn admit_handshake(
    config: &TunnelConfig,
    status: &StatusHandle,
    rate_limiter: &mut HandshakeRateLimiter,
    addr: SocketAddr,
) -> bool {
    if !rate_limiter.check(addr.ip()) {
        status.update(|s| s.counters.handshake_rate_limited += 1);
        tracing::warn!(peer = %addr, "handshake rate limited");
        return false;
    }
    if config.strict_peer_match && addr.ip() != config.encrypted_peer.ip() {
        tracing::warn!(peer = %addr, "handshake from unexpected address");
        return false;
    }
    true
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

async fn accept_next(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// `(rid, attempt, result)` reported by a background handshake task
type HandshakeResult = (u64, u32, std::result::Result<HandshakeOutcome, HandshakeError>);

/// A rekey handshake in flight, or finished and waiting for commit
struct PendingRekey {
    rid: u64,
    suite: Suite,
    epoch: u32,
    /// Server side: the next admitted connection runs this handshake
    awaiting_connection: bool,
    /// Bumped when a connection replaces a running handshake
    attempt: u32,
    replacements_left: u8,
    task: Option<JoinHandle<()>>,
    session: Option<Session>,
}

impl PendingRekey {
    fn new(rid: u64, suite: Suite, epoch: u32, awaiting_connection: bool) -> Self {
        Self {
            rid,
            suite,
            epoch,
            awaiting_connection,
            attempt: 0,
            replacements_left: MAX_HANDSHAKE_REPLACEMENTS,
            task: None,
            session: None,
        }
    }

    /// Hand the handshake slot to a newly admitted connection. A connection
    /// may take over from one still mid-handshake at most
    /// `MAX_HANDSHAKE_REPLACEMENTS` times.
    fn claim_slot(&mut self) -> bool {
        if self.session.is_some() {
            return false;
        }
        if self.awaiting_connection {
            self.awaiting_connection = false;
            return true;
        }
        if self.task.is_none() || self.replacements_left == 0 {
            return false;
        }
        self.cancel();
        self.replacements_left -= 1;
        self.attempt += 1;
        true
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Event {
    Command(Option<ProxyCommand>),
    Plaintext(io::Result<(usize, SocketAddr)>),
    Encrypted(io::Result<(usize, SocketAddr)>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Handshake(Option<HandshakeResult>),
    Tick,
}

struct EventLoop {
    config: TunnelConfig,
    identity: Arc<Identity>,
    sockets: ProxySockets,
    status: StatusHandle,
    commands: mpsc::Receiver<ProxyCommand>,
    commands_open: bool,
    sessions: SessionSet,
    rekey: RekeyMachine,
    transport: HandshakeTransport,
    rate_limiter: HandshakeRateLimiter,
    pending: Option<PendingRekey>,
    /// Negotiation whose session is staged in `sessions`
    staged_rid: Option<u64>,
    waiters: Vec<(u64, RekeyReply)>,
    handshake_tx: mpsc::Sender<HandshakeResult>,
    handshake_rx: mpsc::Receiver<HandshakeResult>,
    /// Last plaintext source, used when no forward address is configured
    app_peer: Option<SocketAddr>,
    last_auto_rekey: Option<Instant>,
    ptx_buf: Vec<u8>,
    enc_buf: Vec<u8>,
}

impl EventLoop {
    async fn run(mut self) -> Result<ProxyStatus> {
        self.status.update(|s| s.running = true);
        self.publish();

        let mut tick = tokio::time::interval(self.config.housekeeping_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                command = self.commands.recv(), if self.commands_open => Event::Command(command),
                received = self.sockets.plaintext_in.recv_from(&mut self.ptx_buf) => Event::Plaintext(received),
                received = self.sockets.encrypted.recv_from(&mut self.enc_buf) => Event::Encrypted(received),
                accepted = accept_next(self.sockets.listener.as_ref()) => Event::Accepted(accepted),
                result = self.handshake_rx.recv() => Event::Handshake(result),
                _ = tick.tick() => Event::Tick,
            };

            match event {
                Event::Command(Some(ProxyCommand::Stop)) => break,
                Event::Command(Some(ProxyCommand::PrepareRekey { suite_id, reply })) => {
                    self.on_rekey_request(&suite_id, Some(reply)).await;
                }
                Event::Command(None) => {
                    tracing::debug!("all proxy handles dropped");
                    self.commands_open = false;
                }
                Event::Plaintext(Ok((len, src))) => self.on_plaintext(len, src).await,
                Event::Encrypted(Ok((len, src))) => self.on_encrypted(len, src).await,
                Event::Plaintext(Err(e)) | Event::Encrypted(Err(e)) => {
                    tracing::debug!(error = %e, "udp receive error");
                }
                Event::Accepted(Ok((stream, addr))) => self.on_connection(stream, addr),
                Event::Accepted(Err(e)) => tracing::warn!(error = %e, "handshake accept failed"),
                Event::Handshake(Some((rid, attempt, result))) => {
                    self.on_handshake_result(rid, attempt, result).await
                }
                Event::Handshake(None) => {}
                Event::Tick => self.on_tick().await,
            }
        }

        if let Some(mut pending) = self.pending.take() {
            pending.cancel();
        }
        for (_, reply) in self.waiters.drain(..) {
            let _ = reply.send(Err(RekeyError::PrepareFailed("proxy stopped".into())));
        }
        self.publish();
        self.status.update(|s| s.running = false);
        tracing::info!(role = %self.config.role, "tunnel stopped");
        Ok(self.status.snapshot())
    }

    /// Copy session and rekey state into the shared status
    fn publish(&self) {
        let current = self.sessions.current();
        let staged_epoch = self.sessions.staged().map(Session::epoch);
        let previous_epoch = self.sessions.previous().map(Session::epoch);
        let rekey = self.rekey.status();
        self.status.update(|s| {
            s.current_suite = Some(current.suite().id().to_string());
            s.session_epoch = Some(current.epoch());
            s.session_id = Some(hex::encode(current.session_id()));
            s.staged_epoch = staged_epoch;
            s.previous_epoch = previous_epoch;
            s.handshake_timing = Some(*current.timing());
            s.rekey = Some(rekey);
        });
    }

    fn record_drop(&self, reason: DropReason, src: SocketAddr) {
        tracing::debug!(%src, %reason, "dropped packet");
        self.status.update(|s| s.counters.record_drop(reason));
    }

    async fn on_plaintext(&mut self, len: usize, src: SocketAddr) {
        self.status.update(|s| {
            s.counters.ptx_in += 1;
            s.counters.ptx_bytes_in += len as u64;
        });
        if self.config.plaintext_forward.is_none() {
            self.app_peer = Some(src);
        }
        if len > self.config.max_plaintext_size {
            self.record_drop(DropReason::OversizedPacket, src);
            return;
        }

        let started = Instant::now();
        let sealed = self.sessions.seal(FrameType::Data, &self.ptx_buf[..len]);
        let elapsed = started.elapsed();
        match sealed {
            Ok(frame) => {
                self.status.update(|s| s.counters.aead_encrypt.record(elapsed));
                self.send_encrypted(&frame).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "encrypt failed");
                self.status.update(|s| s.counters.send_errors += 1);
            }
        }

        let backed_off = self
            .last_auto_rekey
            .is_some_and(|at| at.elapsed() < self.config.rekey_timeout);
        if self.sessions.current().sender().needs_rekey() && !self.rekey.is_active() && !backed_off {
            self.last_auto_rekey = Some(Instant::now());
            let suite_id = self.sessions.current().suite().id().to_string();
            tracing::info!(suite = %suite_id, "sequence threshold reached, rekeying");
            self.on_rekey_request(&suite_id, None).await;
        }
    }

    async fn send_encrypted(&self, frame: &[u8]) {
        match self
            .sockets
            .encrypted
            .send_to(frame, self.config.encrypted_peer)
            .await
        {
            Ok(sent) => self.status.update(|s| {
                s.counters.enc_out += 1;
                s.counters.enc_bytes_out += sent as u64;
            }),
            Err(e) => {
                tracing::debug!(error = %e, "encrypted send failed");
                self.status.update(|s| s.counters.send_errors += 1);
            }
        }
    }

    async fn on_encrypted(&mut self, len: usize, src: SocketAddr) {
        self.status.update(|s| {
            s.counters.enc_in += 1;
            s.counters.enc_bytes_in += len as u64;
        });
        if len > self.config.max_plaintext_size + FRAME_OVERHEAD {
            self.record_drop(DropReason::OversizedPacket, src);
            return;
        }
        if self.config.strict_peer_match && src != self.config.encrypted_peer {
            self.record_drop(DropReason::SourceMismatch, src);
            return;
        }

        let now = Instant::now();
        let opened = self.sessions.open(&self.enc_buf[..len], now);
        let elapsed = now.elapsed();
        let decrypted = match opened {
            Ok(decrypted) => decrypted,
            Err(reason) => {
                self.record_drop(reason, src);
                return;
            }
        };
        self.status.update(|s| s.counters.aead_decrypt.record(elapsed));

        match decrypted.frame_type {
            FrameType::Data => self.deliver(&decrypted.payload).await,
            FrameType::Control => {
                self.status.update(|s| s.counters.control_in += 1);
                match ControlMessage::decode(&decrypted.payload) {
                    Ok(message) => {
                        tracing::debug!(
                            message = message.name(),
                            rid = message.rid(),
                            "control message received"
                        );
                        let epoch = self.sessions.current().epoch();
                        let actions = self.rekey.on_control(message, epoch, now);
                        self.apply(actions).await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable control message");
                        self.record_drop(DropReason::HeaderMalformed, src);
                    }
                }
            }
        }
    }

    async fn deliver(&self, payload: &[u8]) {
        let sent = match (self.config.plaintext_forward, self.app_peer) {
            (Some(forward), _) => self.sockets.plaintext_out.send_to(payload, forward).await,
            (None, Some(peer)) => self.sockets.plaintext_in.send_to(payload, peer).await,
            (None, None) => {
                tracing::debug!("no application peer yet, discarding plaintext");
                return;
            }
        };
        match sent {
            Ok(sent) => self.status.update(|s| {
                s.counters.ptx_out += 1;
                s.counters.ptx_bytes_out += sent as u64;
            }),
            Err(e) => {
                tracing::debug!(error = %e, "plaintext send failed");
                self.status.update(|s| s.counters.send_errors += 1);
            }
        }
    }

    fn on_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        if !admit_handshake(&self.config, &self.status, &mut self.rate_limiter, addr) {
            return;
        }
        let Some(pending) = self.pending.as_mut() else {
            tracing::debug!(peer = %addr, "handshake connection with no rekey in progress");
            return;
        };
        let replacing = pending.task.is_some();
        if !pending.claim_slot() {
            tracing::debug!(peer = %addr, rid = pending.rid, "rekey handshake slot taken");
            return;
        }
        if replacing {
            tracing::warn!(peer = %addr, rid = pending.rid, "replacing stalled rekey handshake");
        }

        let rid = pending.rid;
        let attempt = pending.attempt;
        let suite = pending.suite.clone();
        let identity = self.identity.clone();
        let transport = self.transport.clone();
        let results = self.handshake_tx.clone();
        pending.task = Some(tokio::spawn(async move {
            let result = match identity.as_ref() {
                Identity::Server(server) => transport.accept(stream, suite, server).await,
                Identity::Client(_) => Err(HandshakeError::FramingError(
                    "client cannot accept handshakes".into(),
                )),
            };
            let _ = results.send((rid, attempt, result)).await;
        }));
    }

    fn spawn_client_handshake(&self, rid: u64, suite: Suite) -> JoinHandle<()> {
        let identity = self.identity.clone();
        let transport = self.transport.clone();
        let results = self.handshake_tx.clone();
        let addr = self.config.handshake_addr;
        let connect_timeout = transport.handshake_timeout();
        tokio::spawn(async move {
            let result = async {
                let Identity::Client(pinned) = identity.as_ref() else {
                    return Err(HandshakeError::FramingError(
                        "server cannot initiate handshakes".into(),
                    ));
                };
                let stream = connect_within(addr, connect_timeout).await?;
                transport.connect(stream, suite, pinned).await
            }
            .await;
            let _ = results.send((rid, 0, result)).await;
        })
    }

    async fn on_handshake_result(
        &mut self,
        rid: u64,
        attempt: u32,
        result: std::result::Result<HandshakeOutcome, HandshakeError>,
    ) {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.rid == rid && p.attempt != attempt)
        {
            tracing::debug!(rid, attempt, "ignoring result of replaced handshake");
            return;
        }
        let now = Instant::now();
        let status = match self.pending.as_mut().filter(|p| p.rid == rid) {
            Some(pending) => {
                pending.task = None;
                result.and_then(|outcome| {
                    let session = Session::from_outcome(
                        outcome,
                        self.config.role,
                        pending.epoch,
                        self.config.replay_window,
                        self.config.rekey_sequence_threshold,
                    )?;
                    pending.session = Some(session);
                    Ok(())
                })
            }
            None => result.map(|_| ()),
        };
        if let Err(e) = &status {
            tracing::warn!(rid, error = %e, "rekey handshake failed");
        }
        let actions = self.rekey.on_handshake_complete(rid, status, now);
        self.apply(actions).await;
    }

    async fn on_rekey_request(&mut self, suite_id: &str, reply: Option<RekeyReply>) {
        let now = Instant::now();
        let epoch = self.sessions.current().epoch();
        match self.rekey.request(suite_id, epoch, now) {
            Ok((rid, actions)) => {
                tracing::info!(rid, suite = %suite_id, "rekey requested");
                if let Some(reply) = reply {
                    self.waiters.push((rid, reply));
                }
                self.apply(actions).await;
            }
            Err(e) => {
                tracing::warn!(suite = %suite_id, error = %e, "rekey request rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        if let Some(epoch) = self.sessions.expire_grace(now) {
            tracing::info!(epoch, "grace period over, retired previous epoch");
        }
        let actions = self.rekey.on_tick(now);
        self.apply(actions).await;
        self.publish();
    }

    fn reply(&mut self, rid: u64, result: std::result::Result<RekeyReport, RekeyError>) {
        if let Some(pos) = self.waiters.iter().position(|(r, _)| *r == rid) {
            let (_, reply) = self.waiters.swap_remove(pos);
            let _ = reply.send(result);
        }
    }

    async fn send_control(&mut self, message: &ControlMessage) {
        let frame = message
            .encode()
            .map_err(TunnelError::from)
            .and_then(|body| self.sessions.seal(FrameType::Control, &body));
        match frame {
            Ok(frame) => {
                tracing::debug!(message = message.name(), rid = message.rid(), "control message sent");
                self.status.update(|s| s.counters.control_out += 1);
                self.send_encrypted(&frame).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, message = message.name(), "failed to seal control message");
                self.status.update(|s| s.counters.send_errors += 1);
            }
        }
    }

    /// Carry out what the rekey machine asked for, in order
    async fn apply(&mut self, actions: Vec<RekeyAction>) {
        if actions.is_empty() {
            return;
        }
        let now = Instant::now();
        let grace = self.config.rekey_grace;

        for action in actions {
            match action {
                RekeyAction::Send(message) => self.send_control(&message).await,
                RekeyAction::StartHandshake { rid, suite, epoch } => {
                    if let Some(mut old) = self.pending.take() {
                        old.cancel();
                    }
                    let mut pending = PendingRekey::new(
                        rid,
                        suite.clone(),
                        epoch,
                        self.config.role == Role::Server,
                    );
                    if self.config.role == Role::Client {
                        pending.task = Some(self.spawn_client_handshake(rid, suite));
                    }
                    self.pending = Some(pending);
                }
                RekeyAction::StageSession { rid } => match self.take_pending_session(rid) {
                    Some(session) => {
                        self.sessions.stage(session);
                        self.staged_rid = Some(rid);
                    }
                    None => tracing::warn!(rid, "no prepared session to stage"),
                },
                RekeyAction::ActivatePending { rid, epoch } => {
                    match self.take_pending_session(rid) {
                        Some(session) => {
                            self.sessions.activate(session, now, grace);
                            tracing::info!(rid, epoch, "switched to new epoch");
                        }
                        None => tracing::warn!(rid, "no prepared session to activate"),
                    }
                }
                RekeyAction::PromoteStaged { rid } => {
                    if self.staged_rid == Some(rid) && self.sessions.promote_staged(now, grace) {
                        self.staged_rid = None;
                        tracing::info!(rid, epoch = self.sessions.current().epoch(), "switched to new epoch");
                    }
                }
                RekeyAction::DiscardPending { rid } => {
                    if let Some(mut pending) = self.pending.take() {
                        if pending.rid == rid {
                            pending.cancel();
                        } else {
                            self.pending = Some(pending);
                        }
                    }
                    if self.staged_rid == Some(rid) {
                        self.sessions.discard_staged();
                        self.staged_rid = None;
                    }
                }
                RekeyAction::RevertToPrevious { rid } => {
                    if self.sessions.revert() {
                        tracing::warn!(rid, epoch = self.sessions.current().epoch(), "peer aborted commit, reverted");
                    } else {
                        tracing::warn!(rid, "peer aborted commit but previous session already retired");
                    }
                }
                RekeyAction::Completed {
                    rid,
                    suite,
                    epoch,
                    elapsed,
                } => {
                    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                    tracing::info!(rid, suite = %suite, epoch, elapsed_ms, "rekey complete");
                    self.status.update(|s| {
                        s.counters.rekeys_ok += 1;
                        s.counters.last_rekey_suite = Some(suite.id().to_string());
                        s.counters.last_rekey_ms = Some(unix_ms());
                        s.counters.last_rekey_duration_ms = Some(elapsed_ms);
                    });
                    self.reply(
                        rid,
                        Ok(RekeyReport {
                            rid,
                            suite: suite.id().to_string(),
                            epoch,
                            elapsed_ms,
                        }),
                    );
                }
                RekeyAction::Failed { rid, error } => {
                    tracing::warn!(rid, error = %error, "rekey failed, staying on current session");
                    self.status.update(|s| s.counters.rekeys_fail += 1);
                    self.reply(rid, Err(error));
                }
            }
        }
        self.publish();
    }

    fn take_pending_session(&mut self, rid: u64) -> Option<Session> {
        let pending = self.pending.take()?;
        if pending.rid != rid {
            self.pending = Some(pending);
            return None;
        }
        pending.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::{CryptoBackend, PqBackend};

    fn pending() -> PendingRekey {
        let backend: Arc<dyn CryptoBackend> = Arc::new(PqBackend::new());
        let suite = SuiteRegistry::new(backend)
            .resolve("ml-kem-768+aesgcm+ml-dsa-65")
            .unwrap();
        PendingRekey::new(9, suite, 1, true)
    }

    #[tokio::test]
    async fn test_handshake_slot_replaced_once() {
        let mut slot = pending();
        assert!(slot.claim_slot());
        assert_eq!(slot.attempt, 0);
        slot.task = Some(tokio::spawn(std::future::pending::<()>()));

        // A second connection takes over the stalled one
        assert!(slot.claim_slot());
        assert_eq!(slot.attempt, 1);
        assert!(slot.task.is_none());

        slot.task = Some(tokio::spawn(std::future::pending::<()>()));
        assert!(!slot.claim_slot());
        assert_eq!(slot.attempt, 1);
        slot.cancel();
    }

    #[tokio::test]
    async fn test_finished_handshake_slot_not_reclaimed() {
        let mut slot = pending();
        assert!(slot.claim_slot());
        // Result already reported; nothing running to replace
        assert!(!slot.claim_slot());
    }

    #[tokio::test]
    async fn test_accept_errors_are_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let listener = &listener;
        let mut failures = 2;
        let mut attempts = 0;
        let (_, peer) = next_admitted(
            move || {
                let fail = failures > 0;
                failures -= 1;
                async move {
                    if fail {
                        Err(io::Error::from(io::ErrorKind::ConnectionAborted))
                    } else {
                        listener.accept().await
                    }
                }
            },
            |_| {
                attempts += 1;
                true
            },
        )
        .await;

        let dialed = dialer.await.unwrap();
        assert_eq!(peer, dialed.local_addr().unwrap());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_connect_within_bounds_dial() {
        let blackhole: SocketAddr = "10.255.255.1:5760".parse().unwrap();
        let started = Instant::now();
        let result = connect_within(blackhole, Duration::from_millis(200)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
