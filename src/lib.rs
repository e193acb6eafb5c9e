//! Weft: userspace mesh-networking agent
//!
//! Weft builds virtual TCP (and limited UDP) tunnels across an overlay of
//! cooperating nodes. Every node can take any mix of three roles: ingress
//! (SOCKS5 front-door), transit (hop-by-hop relay), and exit (real outbound
//! sockets plus DNS). Nodes interconnect over long-lived, mutually
//! authenticated, encrypted peer links carrying multiplexed logical streams
//! and a control plane of routing, node-descriptor and command traffic.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft::{Agent, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(std::path::Path::new("weft.toml"))?;
//!     let agent = Agent::new(config)?;
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! client ──SOCKS5──▶ ingress ──stream──▶ transit ──stream──▶ exit ──TCP──▶ target
//!                       │                   │                  │
//!                       └── routing table ──┴── route floods ──┘
//! ```
//!
//! Destinations are matched by longest prefix against CIDR and domain routes
//! learned from a flood-propagated distance-vector protocol. Multi-hop
//! streams are encrypted end to end between their endpoint agents; transit
//! nodes see only ciphertext.

pub mod agent;
pub mod config;
pub mod crypto;
pub mod e2e;
pub mod exit;
pub mod forward;
pub mod identity;
pub mod logging;
pub mod nodeinfo;
pub mod pacer;
pub mod peer;
pub mod proto;
pub mod relay;
pub mod routing;
pub mod socks;
pub mod stream;
pub mod transport;
pub mod udp;

pub use agent::{Agent, AgentStatus};
pub use config::Config;
pub use identity::{AgentId, Identity};
pub use proto::{Destination, StreamKind, WireCode};
pub use routing::{RoutePrefix, RouteTable, RouteTarget};
pub use transport::{TransportError, TransportKind};

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Bad persisted identity or key material
    #[error("identity error: {0}")]
    InvalidIdentity(String),

    /// Malformed or unexpected wire traffic
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Control frame type from a future protocol revision
    #[error("unknown control frame type {0:#04x}")]
    UnknownFrame(u8),

    /// Failure taxonomised on the wire (no_route, dial_failed, ...)
    #[error("{}", .0.as_str())]
    Wire(proto::WireCode),

    /// AEAD failure or nonce regression on an end-to-end stream
    #[error("integrity failure")]
    Integrity,

    /// Authorisation failure; closed without retry
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Named entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Peer session is gone
    #[error("peer {} is gone", .0.short())]
    PeerGone(identity::AgentId),
}

impl WeftError {
    /// Wire code to surface for this failure in a STREAM_OPEN_ACK.
    pub fn wire_code(&self) -> proto::WireCode {
        match self {
            WeftError::Wire(code) => *code,
            WeftError::Integrity => proto::WireCode::Integrity,
            WeftError::Unauthorized(_) => proto::WireCode::Unauthorized,
            WeftError::PeerGone(_) | WeftError::NotFound(_) => proto::WireCode::NoRoute,
            _ => proto::WireCode::Internal,
        }
    }

    /// JSON body shape the observer surface returns for failures.
    pub fn to_api(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "code": self.wire_code().as_str(),
        })
    }
}
