//! Live data-plane sessions and the epoch bookkeeping around a rekey

use std::time::{Duration, Instant};

use crypto::CryptoError;

use crate::error::{DropReason, TunnelError};
use crate::handshake::{HandshakeOutcome, HandshakeTiming};
use crate::suites::Suite;
use crate::types::{Role, SessionId};
use crate::wire::{Decrypted, FrameHeader, FrameType, Receiver, Sender};

/// One keyed epoch: a sender on the outbound key and a receiver on the inbound key
#[derive(Debug)]
pub struct Session {
    session_id: SessionId,
    epoch: u32,
    suite: Suite,
    sender: Sender,
    receiver: Receiver,
    timing: HandshakeTiming,
}

impl Session {
    /// Key a session from a finished handshake
    pub fn from_outcome(
        outcome: HandshakeOutcome,
        role: Role,
        epoch: u32,
        replay_window: u64,
        rekey_threshold: u64,
    ) -> Result<Self, CryptoError> {
        let (send_key, recv_key) = outcome.keys.for_role(role);
        let aead = outcome.suite.aead();
        let sender = Sender::new(aead, send_key, outcome.session_id, epoch, rekey_threshold)?;
        let receiver = Receiver::new(aead, recv_key, outcome.session_id, epoch, replay_window)?;
        Ok(Self {
            session_id: outcome.session_id,
            epoch,
            suite: outcome.suite,
            sender,
            receiver,
            timing: outcome.timing,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    pub fn timing(&self) -> &HandshakeTiming {
        &self.timing
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn seal(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        self.sender.encrypt(frame_type, payload)
    }

    fn matches(&self, header: &FrameHeader) -> bool {
        header.session_id == self.session_id && header.epoch == self.epoch
    }
}

/// The current session plus whatever a rekey has in flight.
///
/// - `staged`: initiator side only. Derived and committed to the peer but not
///   yet acknowledged, so it decrypts but never encrypts.
/// - `previous`: the superseded session, decrypting until its grace deadline
///   and available for a revert.
#[derive(Debug)]
pub struct SessionSet {
    current: Session,
    staged: Option<Session>,
    previous: Option<(Session, Instant)>,
}

impl SessionSet {
    pub fn new(current: Session) -> Self {
        Self {
            current,
            staged: None,
            previous: None,
        }
    }

    pub fn current(&self) -> &Session {
        &self.current
    }

    pub fn staged(&self) -> Option<&Session> {
        self.staged.as_ref()
    }

    pub fn previous(&self) -> Option<&Session> {
        self.previous.as_ref().map(|(session, _)| session)
    }

    /// Encrypt under the current session. Nothing else ever encrypts.
    pub fn seal(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        self.current.seal(frame_type, payload)
    }

    /// Route a frame to whichever session owns its `(session_id, epoch)`
    pub fn open(&mut self, frame: &[u8], now: Instant) -> Result<Decrypted, DropReason> {
        let header = FrameHeader::decode(frame)?;

        if self.current.matches(&header) {
            return self.current.receiver.open(&header, frame);
        }
        if let Some(staged) = self.staged.as_mut().filter(|s| s.matches(&header)) {
            return staged.receiver.open(&header, frame);
        }
        if let Some((previous, deadline)) = self.previous.as_mut() {
            if previous.matches(&header) && now < *deadline {
                return previous.receiver.open(&header, frame);
            }
        }
        Err(DropReason::EpochMismatch)
    }

    /// Install a committed-but-unacknowledged session for decryption only
    pub fn stage(&mut self, session: Session) {
        self.staged = Some(session);
    }

    pub fn discard_staged(&mut self) -> Option<Session> {
        self.staged.take()
    }

    /// Make the staged session current. Returns false if nothing was staged.
    pub fn promote_staged(&mut self, now: Instant, grace: Duration) -> bool {
        match self.staged.take() {
            Some(session) => {
                self.activate(session, now, grace);
                true
            }
            None => false,
        }
    }

    /// Swap in `session`; the old current decrypts until `now + grace`
    pub fn activate(&mut self, session: Session, now: Instant, grace: Duration) {
        let old = std::mem::replace(&mut self.current, session);
        self.previous = Some((old, now + grace));
    }

    /// Undo the last `activate`. Returns false when the old session is gone.
    pub fn revert(&mut self) -> bool {
        match self.previous.take() {
            Some((old, _)) => {
                self.current = old;
                true
            }
            None => false,
        }
    }

    /// Drop the previous session once its grace period has passed
    pub fn expire_grace(&mut self, now: Instant) -> Option<u32> {
        match &self.previous {
            Some((session, deadline)) if now >= *deadline => {
                let epoch = session.epoch;
                self.previous = None;
                Some(epoch)
            }
            _ => None,
        }
    }
}
