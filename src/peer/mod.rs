//! Peer links: handshake, sessions, the session table, reconnect policy

pub mod handshake;
pub mod manager;
pub mod reconnect;
pub mod session;

pub use manager::SessionManager;
pub use reconnect::ReconnectPolicy;
pub use session::{Direction, PeerEvent, PeerSession, SessionState};
