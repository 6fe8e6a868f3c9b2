//! Post-quantum bump-in-the-wire tunnel for MAVLink.
//!
//! Two proxies, a ground-station `server` and a vehicle `client`, bridge a
//! local plaintext UDP socket to an encrypted UDP link between them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Tunnel Layers                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  1. Handshake (TCP)    │  ML-KEM encaps, ML-DSA signature   │
//! │  2. Key schedule       │  HKDF-SHA256(ss, sid ‖ suite)      │
//! │  3. Data plane (UDP)   │  AEAD frames, replay window        │
//! │  4. Rekey (in-band)    │  two-phase commit, new epoch       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pq_tunnel::{Identity, SuiteRegistry, TunnelConfigBuilder, TunnelProxy};
//!
//! let proxy = TunnelProxy::bind(config, registry, Identity::Client(pinned)).await?;
//! let handle = proxy.handle();
//! tokio::spawn(proxy.start("ml-kem-768+aesgcm+ml-dsa-65"));
//!
//! // Later: rotate to a stronger suite without dropping the link
//! handle.prepare_rekey("ml-kem-1024+aesgcm+ml-dsa-87").await?;
//! ```

pub mod config;
pub mod error;
pub mod handshake;
pub mod proxy;
pub mod rekey;
pub mod replay;
pub mod session;
pub mod suites;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use error::{DropReason, HandshakeError, RekeyError, Result, SuiteError, TunnelError};
pub use handshake::{ClientHandshake, HandshakeOutcome, HandshakeTiming, ServerHandshake};
pub use proxy::{ProxyCounters, ProxyHandle, ProxySockets, ProxyStatus, RekeyReport, StatusHandle, TunnelProxy};
pub use rekey::{ControlMessage, RekeyMachine, RekeyPhase};
pub use suites::{Suite, SuiteRegistry};
pub use transport::HandshakeTransport;
pub use types::{Identity, PinnedServerKeys, Psk, Role, ServerIdentity, SessionKeys};
pub use wire::{FrameHeader, FrameType, Receiver, Sender};
