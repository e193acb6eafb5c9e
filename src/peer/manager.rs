//! Session table with duplicate-ID resolution
//!
//! At most one established session per remote agent. When two sessions race
//! (both sides dialing each other), the connection dialed by the higher-ID
//! node survives everywhere: each node keeps the session where it was the
//! dialer if its own ID is greater than the remote's, and the session where
//! it was the acceptor otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::identity::AgentId;
use crate::peer::session::{Direction, PeerSession};

pub struct SessionManager {
    own_id: AgentId,
    sessions: RwLock<HashMap<AgentId, Arc<PeerSession>>>,
}

/// Outcome of offering a new session to the table.
pub enum Admission {
    /// Session installed; carry on.
    Accepted,
    /// Session installed, displacing this older one (caller closes it).
    Replaced(Arc<PeerSession>),
    /// Duplicate lost the tie; caller closes the new session silently.
    Rejected,
}

impl SessionManager {
    pub fn new(own_id: AgentId) -> Self {
        Self {
            own_id,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn preferred_direction(&self, remote: AgentId) -> Direction {
        if self.own_id > remote {
            Direction::Dialer
        } else {
            Direction::Accepted
        }
    }

    /// Offer a freshly established session.
    pub fn admit(&self, session: Arc<PeerSession>) -> Admission {
        let remote = session.remote_id;
        let mut sessions = self.sessions.write();
        match sessions.get(&remote) {
            None => {
                sessions.insert(remote, session);
                Admission::Accepted
            }
            Some(existing) => {
                let preferred = self.preferred_direction(remote);
                if session.direction == preferred && existing.direction != preferred {
                    let old = sessions.insert(remote, session).expect("existing checked");
                    Admission::Replaced(old)
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Drop the table entry, but only if it still refers to this exact
    /// session (a replacement may already have taken the slot).
    pub fn remove(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.write();
        if let Some(current) = sessions.get(&session.remote_id) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.remote_id);
                return true;
            }
        }
        false
    }

    pub fn get(&self, remote: &AgentId) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(remote).cloned()
    }

    pub fn list(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::peer::session::PeerEvent;
    use crate::proto::PeerHello;
    use crate::transport::memory;
    use crate::transport::Session;
    use tokio::sync::mpsc;

    async fn session_pair(
        remote: &Identity,
        direction: Direction,
    ) -> (Arc<PeerSession>, mpsc::Receiver<PeerEvent>) {
        let (transport, far) = memory::pair();
        let control = transport.open_substream().await.unwrap();
        let _far_control = far.accept_substream().await.unwrap();
        let hello = PeerHello {
            agent_id: remote.id,
            display_name: remote.display_name.clone(),
            x25519_public: *remote.public_key().as_bytes(),
            node_info_digest: [0; 32],
            capabilities: 0,
            timestamp: 0,
        };
        let (events_tx, events_rx) = mpsc::channel(16);
        let session = PeerSession::start(
            transport,
            control,
            &hello,
            direction,
            &crate::config::ConnectionsConfig::default(),
            events_tx,
        );
        (session, events_rx)
    }

    #[tokio::test]
    async fn test_higher_id_dialer_wins() {
        // Our ID is higher than the remote's: the session we dialed must
        // displace the one we accepted.
        let own = AgentId([9; 16]);
        let remote = Identity::ephemeral_with_id(AgentId([1; 16]), "low");
        let manager = SessionManager::new(own);

        let (accepted, _rx1) = session_pair(&remote, Direction::Accepted).await;
        let (dialed, _rx2) = session_pair(&remote, Direction::Dialer).await;

        assert!(matches!(manager.admit(Arc::clone(&accepted)), Admission::Accepted));
        match manager.admit(Arc::clone(&dialed)) {
            Admission::Replaced(old) => assert!(Arc::ptr_eq(&old, &accepted)),
            _ => panic!("dialed session should replace accepted one"),
        }
        assert!(Arc::ptr_eq(&manager.get(&remote.id).unwrap(), &dialed));
    }

    #[tokio::test]
    async fn test_lower_id_keeps_accepted() {
        let own = AgentId([1; 16]);
        let remote = Identity::ephemeral_with_id(AgentId([9; 16]), "high");
        let manager = SessionManager::new(own);

        let (accepted, _rx1) = session_pair(&remote, Direction::Accepted).await;
        let (dialed, _rx2) = session_pair(&remote, Direction::Dialer).await;

        assert!(matches!(manager.admit(Arc::clone(&accepted)), Admission::Accepted));
        assert!(matches!(manager.admit(Arc::clone(&dialed)), Admission::Rejected));
        assert!(Arc::ptr_eq(&manager.get(&remote.id).unwrap(), &accepted));
    }

    #[tokio::test]
    async fn test_same_direction_duplicate_rejected() {
        let own = AgentId([1; 16]);
        let remote = Identity::ephemeral_with_id(AgentId([9; 16]), "high");
        let manager = SessionManager::new(own);

        let (first, _rx1) = session_pair(&remote, Direction::Accepted).await;
        let (second, _rx2) = session_pair(&remote, Direction::Accepted).await;

        assert!(matches!(manager.admit(Arc::clone(&first)), Admission::Accepted));
        assert!(matches!(manager.admit(second), Admission::Rejected));
    }

    #[tokio::test]
    async fn test_remove_only_matching_session() {
        let own = AgentId([9; 16]);
        let remote = Identity::ephemeral_with_id(AgentId([1; 16]), "low");
        let manager = SessionManager::new(own);

        let (accepted, _rx1) = session_pair(&remote, Direction::Accepted).await;
        let (dialed, _rx2) = session_pair(&remote, Direction::Dialer).await;
        manager.admit(Arc::clone(&accepted));
        manager.admit(Arc::clone(&dialed));

        // The displaced session must not evict its replacement.
        assert!(!manager.remove(&accepted));
        assert_eq!(manager.len(), 1);
        assert!(manager.remove(&dialed));
        assert!(manager.is_empty());
    }
}
