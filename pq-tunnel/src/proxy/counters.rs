//! Packet counters and status snapshots shared with reporters

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::DropReason;
use crate::handshake::HandshakeTiming;
use crate::rekey::RekeyStatus;
use crate::types::Role;

/// Running aggregate of one primitive's cost
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveStats {
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
}

impl PrimitiveStats {
    pub fn record(&mut self, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.count += 1;
        self.total_ns = self.total_ns.saturating_add(ns);
        self.max_ns = self.max_ns.max(ns);
    }

    pub fn mean_ns(&self) -> u64 {
        self.total_ns.checked_div(self.count).unwrap_or(0)
    }
}

/// Data-plane and rekey counters for one proxy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyCounters {
    /// Plaintext datagrams received from the local application
    pub ptx_in: u64,
    /// Plaintext datagrams delivered to the local application
    pub ptx_out: u64,
    /// Encrypted datagrams received from the peer
    pub enc_in: u64,
    /// Encrypted datagrams sent to the peer
    pub enc_out: u64,
    pub ptx_bytes_in: u64,
    pub ptx_bytes_out: u64,
    pub enc_bytes_in: u64,
    pub enc_bytes_out: u64,

    /// Every dropped datagram, whatever the reason
    pub drops: u64,
    pub drop_replay: u64,
    pub drop_auth: u64,
    pub drop_header: u64,
    pub drop_session_epoch: u64,
    pub drop_src_addr: u64,
    pub drop_oversize: u64,

    pub control_in: u64,
    pub control_out: u64,
    pub rekeys_ok: u64,
    pub rekeys_fail: u64,
    pub last_rekey_suite: Option<String>,
    /// Unix time of the last successful rekey, in milliseconds
    pub last_rekey_ms: Option<u64>,
    /// Duration of the last successful rekey, in milliseconds
    pub last_rekey_duration_ms: Option<u64>,

    pub handshake_rate_limited: u64,
    pub send_errors: u64,

    pub aead_encrypt: PrimitiveStats,
    pub aead_decrypt: PrimitiveStats,
}

impl ProxyCounters {
    pub fn record_drop(&mut self, reason: DropReason) {
        self.drops += 1;
        match reason {
            DropReason::ReplayDetected => self.drop_replay += 1,
            DropReason::AuthFailure => self.drop_auth += 1,
            DropReason::HeaderMalformed => self.drop_header += 1,
            DropReason::EpochMismatch => self.drop_session_epoch += 1,
            DropReason::SourceMismatch => self.drop_src_addr += 1,
            DropReason::OversizedPacket => self.drop_oversize += 1,
        }
    }

    pub fn drops_for(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::ReplayDetected => self.drop_replay,
            DropReason::AuthFailure => self.drop_auth,
            DropReason::HeaderMalformed => self.drop_header,
            DropReason::EpochMismatch => self.drop_session_epoch,
            DropReason::SourceMismatch => self.drop_src_addr,
            DropReason::OversizedPacket => self.drop_oversize,
        }
    }
}

/// Snapshot published by the event loop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub role: Role,
    pub running: bool,
    pub counters: ProxyCounters,
    pub current_suite: Option<String>,
    pub session_epoch: Option<u32>,
    pub session_id: Option<String>,
    /// Committed by us, awaiting the peer's acknowledgement
    pub staged_epoch: Option<u32>,
    /// Superseded epoch still decrypting within its grace period
    pub previous_epoch: Option<u32>,
    pub handshake_timing: Option<HandshakeTiming>,
    pub rekey: Option<RekeyStatus>,
}

impl ProxyStatus {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            running: false,
            counters: ProxyCounters::default(),
            current_suite: None,
            session_epoch: None,
            session_id: None,
            staged_epoch: None,
            previous_epoch: None,
            handshake_timing: None,
            rekey: None,
        }
    }
}

/// Thread-safe read access to the proxy's status
#[derive(Clone, Debug)]
pub struct StatusHandle {
    inner: Arc<Mutex<ProxyStatus>>,
}

impl StatusHandle {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProxyStatus::new(role))),
        }
    }

    /// A consistent point-in-time copy
    pub fn snapshot(&self) -> ProxyStatus {
        self.inner.lock().clone()
    }

    pub fn counters(&self) -> ProxyCounters {
        self.inner.lock().counters.clone()
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ProxyStatus) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_tally() {
        let mut counters = ProxyCounters::default();
        counters.record_drop(DropReason::ReplayDetected);
        counters.record_drop(DropReason::ReplayDetected);
        counters.record_drop(DropReason::OversizedPacket);
        assert_eq!(counters.drops, 3);
        assert_eq!(counters.drops_for(DropReason::ReplayDetected), 2);
        assert_eq!(counters.drop_oversize, 1);
        assert_eq!(counters.drops_for(DropReason::AuthFailure), 0);
    }

    #[test]
    fn test_primitive_stats() {
        let mut stats = PrimitiveStats::default();
        assert_eq!(stats.mean_ns(), 0);
        stats.record(Duration::from_nanos(100));
        stats.record(Duration::from_nanos(300));
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean_ns(), 200);
        assert_eq!(stats.max_ns, 300);
    }

    #[test]
    fn test_snapshot_serializes() {
        let handle = StatusHandle::new(Role::Server);
        handle.update(|s| {
            s.counters.ptx_in = 4;
            s.current_suite = Some("ml-kem-768+aesgcm+ml-dsa-65".into());
        });
        let json = serde_json::to_value(handle.snapshot()).unwrap();
        assert_eq!(json["role"], "Server");
        assert_eq!(json["counters"]["ptx_in"], 4);
        assert_eq!(json["current_suite"], "ml-kem-768+aesgcm+ml-dsa-65");
    }
}
