//! Tunnel configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::types::{Psk, Role};

pub const MIN_REPLAY_WINDOW: u64 = 64;
pub const MAX_REPLAY_WINDOW: u64 = 8192;

/// Immutable settings for one proxy instance
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Which end of the tunnel this is
    pub role: Role,

    /// Where the local application sends plaintext to us
    pub plaintext_listen: SocketAddr,

    /// Where decrypted traffic is delivered. `None` replies to the last
    /// plaintext source instead.
    pub plaintext_forward: Option<SocketAddr>,

    /// Local UDP address for encrypted traffic
    pub encrypted_listen: SocketAddr,

    /// Remote peer's encrypted UDP address
    pub encrypted_peer: SocketAddr,

    /// TCP address for handshakes: bound by the server, dialled by the client
    pub handshake_addr: SocketAddr,

    /// Fleet pre-shared key. Pre-authentication is mandatory when set.
    pub psk: Option<Psk>,

    /// Permit suites whose KEM and signature levels differ
    pub allow_cross_level: bool,

    /// Overall deadline for the initial handshake
    pub handshake_timeout: Duration,

    /// Deadline for the prepare phase of a rekey, handshake included
    pub rekey_timeout: Duration,

    /// Maximum size of one handshake message
    pub max_handshake_message_size: usize,

    /// Sequences tolerated below the highest one received
    pub replay_window: u64,

    /// How long a superseded epoch keeps decrypting after a rekey
    pub rekey_grace: Duration,

    /// Sender sequence at which an automatic rekey is started
    pub rekey_sequence_threshold: u64,

    /// Largest plaintext datagram accepted for encryption
    pub max_plaintext_size: usize,

    /// Drop encrypted datagrams that do not come from `encrypted_peer`
    pub strict_peer_match: bool,

    /// Handshake attempts allowed per source IP in a burst
    pub rate_limit_burst: u32,

    /// Handshake attempt tokens restored per second
    pub rate_limit_refill_per_sec: f64,

    /// Interval for deadline and grace-period checks
    pub housekeeping_interval: Duration,

    /// Whether to log detailed handshake information
    pub verbose_logging: bool,
}

impl TunnelConfig {
    /// Create a configuration with default tuning
    pub fn new(
        role: Role,
        plaintext_listen: SocketAddr,
        encrypted_listen: SocketAddr,
        encrypted_peer: SocketAddr,
        handshake_addr: SocketAddr,
    ) -> Self {
        Self {
            role,
            plaintext_listen,
            plaintext_forward: None,
            encrypted_listen,
            encrypted_peer,
            handshake_addr,
            psk: None,
            allow_cross_level: false,
            handshake_timeout: Duration::from_secs(30),
            rekey_timeout: Duration::from_secs(45),
            max_handshake_message_size: 64 * 1024, // 64 KB
            replay_window: 1024,
            rekey_grace: Duration::from_secs(5),
            rekey_sequence_threshold: 1 << 63,
            max_plaintext_size: 16 * 1024,
            strict_peer_match: true,
            rate_limit_burst: 5,
            rate_limit_refill_per_sec: 1.0,
            housekeeping_interval: Duration::from_millis(100),
            verbose_logging: false,
        }
    }

    /// Set the handshake timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_psk(mut self, psk: Psk) -> Self {
        self.psk = Some(psk);
        self
    }

    pub fn with_plaintext_forward(mut self, addr: SocketAddr) -> Self {
        self.plaintext_forward = Some(addr);
        self
    }

    pub fn with_rekey_grace(mut self, grace: Duration) -> Self {
        self.rekey_grace = grace;
        self
    }

    pub fn with_replay_window(mut self, window: u64) -> Self {
        self.replay_window = window;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    /// How long the initiator waits for a CommitAck. Bounded by the grace
    /// period so the peer still holds the old session when an Abort arrives.
    pub fn commit_timeout(&self) -> Duration {
        self.rekey_timeout.min(self.rekey_grace / 2)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !(MIN_REPLAY_WINDOW..=MAX_REPLAY_WINDOW).contains(&self.replay_window) {
            return Err("replay window must be between 64 and 8192");
        }
        if self.handshake_timeout.is_zero() || self.rekey_timeout.is_zero() {
            return Err("timeouts must be non-zero");
        }
        if self.rekey_grace.is_zero() {
            return Err("rekey grace must be non-zero");
        }
        if self.housekeeping_interval.is_zero() {
            return Err("housekeeping interval must be non-zero");
        }
        if self.max_plaintext_size == 0 || self.max_handshake_message_size == 0 {
            return Err("size limits must be non-zero");
        }
        if self.rate_limit_burst == 0 || self.rate_limit_refill_per_sec <= 0.0 {
            return Err("rate limit must allow at least one attempt");
        }
        Ok(())
    }
}

/// Builder for TunnelConfig
pub struct TunnelConfigBuilder {
    role: Role,
    plaintext_listen: Option<SocketAddr>,
    plaintext_forward: Option<SocketAddr>,
    encrypted_listen: Option<SocketAddr>,
    encrypted_peer: Option<SocketAddr>,
    handshake_addr: Option<SocketAddr>,
    psk: Option<Psk>,
    allow_cross_level: bool,
    handshake_timeout: Duration,
    rekey_timeout: Duration,
    max_handshake_message_size: usize,
    replay_window: u64,
    rekey_grace: Duration,
    rekey_sequence_threshold: u64,
    max_plaintext_size: usize,
    strict_peer_match: bool,
    rate_limit_burst: u32,
    rate_limit_refill_per_sec: f64,
    housekeeping_interval: Duration,
    verbose_logging: bool,
}

impl TunnelConfigBuilder {
    /// Create a new builder with defaults
    pub fn new(role: Role) -> Self {
        Self {
            role,
            plaintext_listen: None,
            plaintext_forward: None,
            encrypted_listen: None,
            encrypted_peer: None,
            handshake_addr: None,
            psk: None,
            allow_cross_level: false,
            handshake_timeout: Duration::from_secs(30),
            rekey_timeout: Duration::from_secs(45),
            max_handshake_message_size: 64 * 1024,
            replay_window: 1024,
            rekey_grace: Duration::from_secs(5),
            rekey_sequence_threshold: 1 << 63,
            max_plaintext_size: 16 * 1024,
            strict_peer_match: true,
            rate_limit_burst: 5,
            rate_limit_refill_per_sec: 1.0,
            housekeeping_interval: Duration::from_millis(100),
            verbose_logging: false,
        }
    }

    pub fn plaintext_listen(mut self, addr: SocketAddr) -> Self {
        self.plaintext_listen = Some(addr);
        self
    }

    pub fn plaintext_forward(mut self, addr: SocketAddr) -> Self {
        self.plaintext_forward = Some(addr);
        self
    }

    pub fn encrypted_listen(mut self, addr: SocketAddr) -> Self {
        self.encrypted_listen = Some(addr);
        self
    }

    pub fn encrypted_peer(mut self, addr: SocketAddr) -> Self {
        self.encrypted_peer = Some(addr);
        self
    }

    pub fn handshake_addr(mut self, addr: SocketAddr) -> Self {
        self.handshake_addr = Some(addr);
        self
    }

    /// Set the pre-shared key from its hex form
    pub fn psk_hex(mut self, hex: &str) -> Result<Self, &'static str> {
        self.psk = Some(Psk::from_hex(hex)?);
        Ok(self)
    }

    pub fn psk(mut self, psk: Psk) -> Self {
        self.psk = Some(psk);
        self
    }

    pub fn allow_cross_level(mut self, allow: bool) -> Self {
        self.allow_cross_level = allow;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn rekey_timeout(mut self, timeout: Duration) -> Self {
        self.rekey_timeout = timeout;
        self
    }

    /// Set maximum handshake message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_handshake_message_size = size;
        self
    }

    pub fn replay_window(mut self, window: u64) -> Self {
        self.replay_window = window;
        self
    }

    pub fn rekey_grace(mut self, grace: Duration) -> Self {
        self.rekey_grace = grace;
        self
    }

    pub fn rekey_sequence_threshold(mut self, threshold: u64) -> Self {
        self.rekey_sequence_threshold = threshold;
        self
    }

    pub fn max_plaintext_size(mut self, size: usize) -> Self {
        self.max_plaintext_size = size;
        self
    }

    pub fn strict_peer_match(mut self, strict: bool) -> Self {
        self.strict_peer_match = strict;
        self
    }

    pub fn rate_limit(mut self, burst: u32, refill_per_sec: f64) -> Self {
        self.rate_limit_burst = burst;
        self.rate_limit_refill_per_sec = refill_per_sec;
        self
    }

    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// Enable verbose logging
    pub fn verbose(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<TunnelConfig, &'static str> {
        let config = TunnelConfig {
            role: self.role,
            plaintext_listen: self.plaintext_listen.ok_or("plaintext listen address is required")?,
            plaintext_forward: self.plaintext_forward,
            encrypted_listen: self.encrypted_listen.ok_or("encrypted listen address is required")?,
            encrypted_peer: self.encrypted_peer.ok_or("encrypted peer address is required")?,
            handshake_addr: self.handshake_addr.ok_or("handshake address is required")?,
            psk: self.psk,
            allow_cross_level: self.allow_cross_level,
            handshake_timeout: self.handshake_timeout,
            rekey_timeout: self.rekey_timeout,
            max_handshake_message_size: self.max_handshake_message_size,
            replay_window: self.replay_window,
            rekey_grace: self.rekey_grace,
            rekey_sequence_threshold: self.rekey_sequence_threshold,
            max_plaintext_size: self.max_plaintext_size,
            strict_peer_match: self.strict_peer_match,
            rate_limit_burst: self.rate_limit_burst,
            rate_limit_refill_per_sec: self.rate_limit_refill_per_sec,
            housekeeping_interval: self.housekeeping_interval,
            verbose_logging: self.verbose_logging,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(Role::Client)
            .plaintext_listen(addr(14550))
            .encrypted_listen(addr(15000))
            .encrypted_peer(addr(15001))
            .handshake_addr(addr(16000))
    }

    #[test]
    fn test_defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.replay_window, 1024);
        assert_eq!(config.max_handshake_message_size, 64 * 1024);
        assert!(config.strict_peer_match);
        assert!(config.psk.is_none());
        assert_eq!(config.commit_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_missing_address() {
        let result = TunnelConfigBuilder::new(Role::Server)
            .plaintext_listen(addr(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_replay_window_bounds() {
        assert!(builder().replay_window(63).build().is_err());
        assert!(builder().replay_window(64).build().is_ok());
        assert!(builder().replay_window(8192).build().is_ok());
        assert!(builder().replay_window(8193).build().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(builder().handshake_timeout(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_psk_hex() {
        let config = builder().psk_hex(&"ab".repeat(32)).unwrap().build().unwrap();
        assert_eq!(config.psk.unwrap().as_bytes(), &[0xab; 32]);
        assert!(builder().psk_hex("abcd").is_err());
    }
}
