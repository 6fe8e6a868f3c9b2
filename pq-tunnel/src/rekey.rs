//! In-band rekey: a two-phase commit carried in control frames.
//!
//! ```text
//!   initiator                         responder
//!   ─────────                         ─────────
//!   Prepare{rid, suite}  ───────────►
//!                        ◄─────────── PrepareAck{rid}   (or Abort)
//!          ═══════ fresh handshake on the new suite ═══════
//!   Prepared{rid}        ◄──────────► Prepared{rid}
//!   stage new receiver
//!   Commit{rid, epoch}   ───────────►
//!                                     swap, keep old receiver for grace
//!                        ◄─────────── CommitAck{rid, epoch}
//!   swap sender
//! ```
//!
//! [`RekeyMachine`] holds no sockets or sessions. Every input returns the
//! [`RekeyAction`]s the event loop must carry out, in order.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bincode::Options;
use crypto::SignatureAlgorithm;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{HandshakeError, RekeyError};
use crate::suites::{Suite, SuiteRegistry};
use crate::types::Role;

/// Upper bound on an encoded control message
pub const MAX_CONTROL_SIZE: u64 = 1024;

const SEEN_RID_CAPACITY: usize = 256;

/// Body of a control frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Prepare { rid: u64, suite: String },
    PrepareAck { rid: u64 },
    Prepared { rid: u64 },
    Commit { rid: u64, epoch: u32 },
    CommitAck { rid: u64, epoch: u32 },
    Abort { rid: u64, reason: RekeyError },
}

fn control_bincode() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_CONTROL_SIZE)
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        control_bincode().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        control_bincode().deserialize(bytes)
    }

    pub fn rid(&self) -> u64 {
        match self {
            ControlMessage::Prepare { rid, .. }
            | ControlMessage::PrepareAck { rid }
            | ControlMessage::Prepared { rid }
            | ControlMessage::Commit { rid, .. }
            | ControlMessage::CommitAck { rid, .. }
            | ControlMessage::Abort { rid, .. } => *rid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Prepare { .. } => "Prepare",
            ControlMessage::PrepareAck { .. } => "PrepareAck",
            ControlMessage::Prepared { .. } => "Prepared",
            ControlMessage::Commit { .. } => "Commit",
            ControlMessage::CommitAck { .. } => "CommitAck",
            ControlMessage::Abort { .. } => "Abort",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RekeyPhase {
    Idle,
    Preparing,
    Prepared,
    Committing,
    Aborted,
}

/// Point-in-time view of the negotiation, for status snapshots
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyStatus {
    pub phase: RekeyPhase,
    pub rid: Option<u64>,
    pub target_suite: Option<String>,
    pub initiator: bool,
    pub last_error: Option<RekeyError>,
}

/// Work the event loop must perform on behalf of the machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RekeyAction {
    /// Encrypt and send a control frame under the current session
    Send(ControlMessage),
    /// Run a handshake for `suite`; its session will carry `epoch`
    StartHandshake { rid: u64, suite: Suite, epoch: u32 },
    /// Install the pending session for decryption only
    StageSession { rid: u64 },
    /// Make the pending session current, keeping the old one for grace
    ActivatePending { rid: u64, epoch: u32 },
    /// Make the staged session current
    PromoteStaged { rid: u64 },
    /// Cancel the handshake task and drop any pending or staged session
    DiscardPending { rid: u64 },
    /// Return to the session that was current before the last activation
    RevertToPrevious { rid: u64 },
    Completed {
        rid: u64,
        suite: Suite,
        epoch: u32,
        elapsed: Duration,
    },
    Failed { rid: u64, error: RekeyError },
}

#[derive(Debug)]
struct Negotiation {
    rid: u64,
    suite: Suite,
    initiator: bool,
    target_epoch: u32,
    handshake_started: bool,
    local_prepared: bool,
    peer_prepared: bool,
    started: Instant,
    deadline: Instant,
}

/// Two-phase-commit rekey negotiation for one side of the tunnel
#[derive(Debug)]
pub struct RekeyMachine {
    role: Role,
    registry: SuiteRegistry,
    signatures: BTreeSet<SignatureAlgorithm>,
    prepare_timeout: Duration,
    commit_timeout: Duration,
    /// How long a responder honours an Abort for a commit it already applied
    revert_window: Duration,
    phase: RekeyPhase,
    active: Option<Negotiation>,
    /// Responder-side commit that may still be aborted by the initiator
    revertible: Option<(u64, Instant)>,
    last_error: Option<RekeyError>,
    seen: HashSet<u64>,
    seen_order: VecDeque<u64>,
}

impl RekeyMachine {
    pub fn new(
        role: Role,
        registry: SuiteRegistry,
        signatures: impl IntoIterator<Item = SignatureAlgorithm>,
        prepare_timeout: Duration,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            role,
            registry,
            signatures: signatures.into_iter().collect(),
            prepare_timeout,
            commit_timeout,
            revert_window: commit_timeout * 2,
            phase: RekeyPhase::Idle,
            active: None,
            revertible: None,
            last_error: None,
            seen: HashSet::new(),
            seen_order: VecDeque::with_capacity(SEEN_RID_CAPACITY),
        }
    }

    /// Keep a responder-side commit revertible for `window`. It must outlast
    /// the initiator's commit deadline plus the Abort's delivery, and is only
    /// useful while the previous session is still held.
    pub fn with_revert_window(mut self, window: Duration) -> Self {
        self.revert_window = window.max(self.commit_timeout);
        self
    }

    pub fn phase(&self) -> RekeyPhase {
        self.phase
    }

    /// True while a negotiation is in flight
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn status(&self) -> RekeyStatus {
        RekeyStatus {
            phase: self.phase,
            rid: self.active.as_ref().map(|n| n.rid),
            target_suite: self.active.as_ref().map(|n| n.suite.id().to_string()),
            initiator: self.active.as_ref().is_some_and(|n| n.initiator),
            last_error: self.last_error.clone(),
        }
    }

    fn validate(&self, suite_id: &str) -> Result<Suite, RekeyError> {
        let suite = self
            .registry
            .resolve(suite_id)
            .map_err(|e| RekeyError::SuiteUnsupported(e.to_string()))?;
        if !self.signatures.contains(&suite.sig()) {
            return Err(RekeyError::SuiteUnsupported(format!(
                "no identity key for {}",
                suite.sig()
            )));
        }
        Ok(suite)
    }

    fn remember(&mut self, rid: u64) -> bool {
        if !self.seen.insert(rid) {
            return false;
        }
        if self.seen_order.len() == SEEN_RID_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen_order.push_back(rid);
        true
    }

    fn next_epoch(current_epoch: u32) -> Result<u32, RekeyError> {
        current_epoch.checked_add(1).ok_or(RekeyError::EpochExhausted)
    }

    fn is_current(&self, rid: u64) -> bool {
        self.active.as_ref().is_some_and(|n| n.rid == rid)
    }

    fn abort_active(&mut self, error: RekeyError, notify_peer: bool) -> Vec<RekeyAction> {
        let Some(negotiation) = self.active.take() else {
            return Vec::new();
        };
        self.phase = RekeyPhase::Aborted;
        self.last_error = Some(error.clone());

        let mut actions = Vec::with_capacity(3);
        if notify_peer {
            actions.push(RekeyAction::Send(ControlMessage::Abort {
                rid: negotiation.rid,
                reason: error.clone(),
            }));
        }
        actions.push(RekeyAction::DiscardPending {
            rid: negotiation.rid,
        });
        actions.push(RekeyAction::Failed {
            rid: negotiation.rid,
            error,
        });
        actions
    }

    fn finish(&mut self, now: Instant) -> Vec<RekeyAction> {
        let Some(negotiation) = self.active.take() else {
            return Vec::new();
        };
        self.phase = RekeyPhase::Idle;
        self.last_error = None;
        vec![RekeyAction::Completed {
            rid: negotiation.rid,
            suite: negotiation.suite,
            epoch: negotiation.target_epoch,
            elapsed: now.saturating_duration_since(negotiation.started),
        }]
    }

    /// Begin a negotiation as initiator. Returns the new request id.
    pub fn request(
        &mut self,
        suite_id: &str,
        current_epoch: u32,
        now: Instant,
    ) -> Result<(u64, Vec<RekeyAction>), RekeyError> {
        if self.active.is_some() {
            return Err(RekeyError::Busy);
        }
        let suite = self.validate(suite_id)?;
        let target_epoch = Self::next_epoch(current_epoch)?;

        let mut rid = rand::thread_rng().next_u64();
        while !self.remember(rid) {
            rid = rand::thread_rng().next_u64();
        }

        let mut actions = vec![RekeyAction::Send(ControlMessage::Prepare {
            rid,
            suite: suite.id().to_string(),
        })];
        // The server listens, so it must be ready before the client dials in
        let handshake_started = self.role == Role::Server;
        if handshake_started {
            actions.push(RekeyAction::StartHandshake {
                rid,
                suite: suite.clone(),
                epoch: target_epoch,
            });
        }

        self.phase = RekeyPhase::Preparing;
        self.active = Some(Negotiation {
            rid,
            suite,
            initiator: true,
            target_epoch,
            handshake_started,
            local_prepared: false,
            peer_prepared: false,
            started: now,
            deadline: now + self.prepare_timeout,
        });
        Ok((rid, actions))
    }

    /// Feed a decrypted control message from the peer
    pub fn on_control(
        &mut self,
        message: ControlMessage,
        current_epoch: u32,
        now: Instant,
    ) -> Vec<RekeyAction> {
        match message {
            ControlMessage::Prepare { rid, suite } => {
                self.on_prepare(rid, &suite, current_epoch, now)
            }
            ControlMessage::PrepareAck { rid } => self.on_prepare_ack(rid),
            ControlMessage::Prepared { rid } => {
                if let Some(n) = self.active.as_mut().filter(|n| n.rid == rid) {
                    n.peer_prepared = true;
                }
                self.maybe_commit(now)
            }
            ControlMessage::Commit { rid, epoch } => self.on_commit(rid, epoch, now),
            ControlMessage::CommitAck { rid, epoch } => {
                let acked = self.active.as_ref().is_some_and(|n| {
                    n.rid == rid && n.initiator && n.target_epoch == epoch
                }) && self.phase == RekeyPhase::Committing;
                if !acked {
                    return Vec::new();
                }
                let mut actions = vec![RekeyAction::PromoteStaged { rid }];
                actions.extend(self.finish(now));
                actions
            }
            ControlMessage::Abort { rid, reason } => {
                if self.is_current(rid) {
                    return self.abort_active(reason, false);
                }
                match self.revertible {
                    Some((committed, _)) if committed == rid => {
                        self.revertible = None;
                        self.last_error = Some(reason.clone());
                        vec![
                            RekeyAction::RevertToPrevious { rid },
                            RekeyAction::Failed { rid, error: reason },
                        ]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    fn on_prepare(
        &mut self,
        rid: u64,
        suite_id: &str,
        current_epoch: u32,
        now: Instant,
    ) -> Vec<RekeyAction> {
        if !self.remember(rid) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if let Some(active) = &self.active {
            // Simultaneous proposals: the server's wins
            if active.initiator && self.role == Role::Client && self.phase == RekeyPhase::Preparing
            {
                let ours = active.rid;
                self.active = None;
                self.last_error = Some(RekeyError::Busy);
                actions.push(RekeyAction::DiscardPending { rid: ours });
                actions.push(RekeyAction::Failed {
                    rid: ours,
                    error: RekeyError::Busy,
                });
            } else {
                return vec![RekeyAction::Send(ControlMessage::Abort {
                    rid,
                    reason: RekeyError::Busy,
                })];
            }
        }

        let accepted = self
            .validate(suite_id)
            .and_then(|suite| Ok((suite, Self::next_epoch(current_epoch)?)));
        let (suite, target_epoch) = match accepted {
            Ok(accepted) => accepted,
            Err(reason) => {
                actions.push(RekeyAction::Send(ControlMessage::Abort { rid, reason }));
                return actions;
            }
        };

        actions.push(RekeyAction::Send(ControlMessage::PrepareAck { rid }));
        actions.push(RekeyAction::StartHandshake {
            rid,
            suite: suite.clone(),
            epoch: target_epoch,
        });
        self.phase = RekeyPhase::Preparing;
        self.active = Some(Negotiation {
            rid,
            suite,
            initiator: false,
            target_epoch,
            handshake_started: true,
            local_prepared: false,
            peer_prepared: false,
            started: now,
            deadline: now + self.prepare_timeout,
        });
        actions
    }

    fn on_prepare_ack(&mut self, rid: u64) -> Vec<RekeyAction> {
        match self.active.as_mut() {
            Some(n) if n.rid == rid && n.initiator && !n.handshake_started => {
                n.handshake_started = true;
                vec![RekeyAction::StartHandshake {
                    rid,
                    suite: n.suite.clone(),
                    epoch: n.target_epoch,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn on_commit(&mut self, rid: u64, epoch: u32, now: Instant) -> Vec<RekeyAction> {
        let Some((local_prepared, target_epoch)) = self
            .active
            .as_ref()
            .filter(|n| n.rid == rid && !n.initiator)
            .map(|n| (n.local_prepared, n.target_epoch))
        else {
            return Vec::new();
        };
        if !local_prepared {
            return self.abort_active(
                RekeyError::PrepareFailed("commit before local handshake completed".into()),
                true,
            );
        }
        if target_epoch != epoch {
            return self.abort_active(
                RekeyError::PrepareFailed(format!(
                    "commit for epoch {epoch}, expected {target_epoch}"
                )),
                true,
            );
        }

        self.revertible = Some((rid, now + self.revert_window));
        let mut actions = vec![
            RekeyAction::ActivatePending { rid, epoch },
            RekeyAction::Send(ControlMessage::CommitAck { rid, epoch }),
        ];
        actions.extend(self.finish(now));
        actions
    }

    fn maybe_commit(&mut self, now: Instant) -> Vec<RekeyAction> {
        let ready = self.phase == RekeyPhase::Prepared
            && self
                .active
                .as_ref()
                .is_some_and(|n| n.initiator && n.local_prepared && n.peer_prepared);
        if !ready {
            return Vec::new();
        }
        let Some(n) = self.active.as_mut() else {
            return Vec::new();
        };
        n.deadline = now + self.commit_timeout;
        self.phase = RekeyPhase::Committing;
        vec![
            RekeyAction::StageSession { rid: n.rid },
            RekeyAction::Send(ControlMessage::Commit {
                rid: n.rid,
                epoch: n.target_epoch,
            }),
        ]
    }

    /// Report the outcome of the background handshake for `rid`
    pub fn on_handshake_complete(
        &mut self,
        rid: u64,
        result: Result<(), HandshakeError>,
        now: Instant,
    ) -> Vec<RekeyAction> {
        if !self.is_current(rid) {
            return vec![RekeyAction::DiscardPending { rid }];
        }
        if let Err(e) = result {
            return self.abort_active(RekeyError::PrepareFailed(e.to_string()), true);
        }

        if let Some(n) = self.active.as_mut() {
            n.local_prepared = true;
        }
        self.phase = RekeyPhase::Prepared;
        let mut actions = vec![RekeyAction::Send(ControlMessage::Prepared { rid })];
        actions.extend(self.maybe_commit(now));
        actions
    }

    /// Enforce deadlines
    pub fn on_tick(&mut self, now: Instant) -> Vec<RekeyAction> {
        if matches!(self.revertible, Some((_, until)) if now >= until) {
            self.revertible = None;
        }

        let Some(n) = &self.active else {
            return Vec::new();
        };
        if now < n.deadline {
            return Vec::new();
        }
        let error = match self.phase {
            RekeyPhase::Committing => RekeyError::CommitTimeout,
            _ => RekeyError::PrepareFailed("peer did not prepare in time".into()),
        };
        self.abort_active(error, true)
    }
}
