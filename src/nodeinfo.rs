//! Node descriptors and their flood propagation
//!
//! Each agent periodically floods a versioned descriptor of itself. Agent ID,
//! roles and offered routes stay in the clear because routing needs them;
//! environment details (hostname, addresses, shells, forward keys) can be
//! sealed under the mesh management public key so only operator nodes read
//! them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::SealedBlob;
use crate::identity::AgentId;
use crate::routing::RoutePrefix;
use crate::WeftError;

/// Roles a node offers to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Ingress,
    Transit,
    Exit,
    ForwardIngress,
    ForwardExit,
}

/// Environment details only operators should see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
    pub uptime_secs: u64,
    /// Non-loopback addresses.
    pub addresses: Vec<String>,
    /// Forward listener keys this node serves as ingress.
    pub forward_listeners: Vec<String>,
    /// Forward exit keys this node terminates.
    pub forward_exits: Vec<String>,
    pub shell_available: bool,
}

/// A flooded self-advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub agent_id: AgentId,
    pub display_name: String,
    /// Monotonic per-agent version; a newer version supersedes an older one
    /// and a re-flood of the same version is a no-op.
    pub version: u64,
    pub roles: Vec<Role>,
    pub exit_routes: Vec<RoutePrefix>,
    /// Present when the mesh has no management key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<SensitiveInfo>,
    /// Present instead of `sensitive` when sealed to the management key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sealed: Option<SealedBlob>,
    /// Agents this descriptor traversed, for flood loop suppression.
    #[serde(default)]
    pub path: Vec<AgentId>,
}

impl NodeDescriptor {
    /// Digest over identity-relevant fields, carried in PEER_HELLO.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.agent_id.as_bytes());
        hasher.update(self.version.to_be_bytes());
        if let Ok(routes) = serde_json::to_vec(&self.exit_routes) {
            hasher.update(&routes);
        }
        hasher.finalize().into()
    }

    /// Seal the sensitive section for the given management key, leaving
    /// routing-relevant fields in the clear.
    pub fn sealed_for(
        mut self,
        management_key: &x25519_dalek::PublicKey,
    ) -> Result<Self, WeftError> {
        if let Some(sensitive) = self.sensitive.take() {
            let plain = serde_json::to_vec(&sensitive)?;
            self.sealed = Some(crate::crypto::seal(&plain, management_key)?);
        }
        Ok(self)
    }

    /// Decrypt the sealed section with the management private key.
    pub fn unseal(
        &self,
        management_secret: &x25519_dalek::StaticSecret,
    ) -> Result<Option<SensitiveInfo>, WeftError> {
        match &self.sealed {
            Some(blob) => {
                let plain = crate::crypto::open_sealed(blob, management_secret)?;
                Ok(Some(serde_json::from_slice(&plain)?))
            }
            None => Ok(self.sensitive.clone()),
        }
    }
}

struct StoredDescriptor {
    desc: NodeDescriptor,
    /// Peer the freshest copy arrived through; the next hop toward the
    /// descriptor's owner for agent-addressed streams.
    via: AgentId,
    seen: Instant,
}

/// Known descriptors, keyed by agent, with version suppression.
pub struct NodeInfoStore {
    own_id: AgentId,
    ttl: Duration,
    inner: RwLock<HashMap<AgentId, StoredDescriptor>>,
}

impl NodeInfoStore {
    pub fn new(own_id: AgentId, ttl: Duration) -> Self {
        Self {
            own_id,
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Accept a descriptor flooded to us by `via`. Returns the copy to
    /// re-flood when it is new information.
    pub fn accept(&self, mut desc: NodeDescriptor, via: AgentId, now: Instant) -> Option<NodeDescriptor> {
        if desc.agent_id == self.own_id || desc.path.contains(&self.own_id) {
            return None;
        }
        let mut inner = self.inner.write();
        match inner.get_mut(&desc.agent_id) {
            Some(existing) if existing.desc.version >= desc.version => {
                // Stale or identical version: refresh liveness only.
                existing.seen = now;
                log::trace!(
                    "[NODEINFO] Suppressed descriptor v{} for {} (have v{})",
                    desc.version,
                    desc.agent_id.short(),
                    existing.desc.version
                );
                None
            }
            _ => {
                desc.path.push(self.own_id);
                inner.insert(
                    desc.agent_id,
                    StoredDescriptor { desc: desc.clone(), via, seen: now },
                );
                Some(desc)
            }
        }
    }

    /// Drop descriptors not refreshed within the TTL.
    pub fn expire(&self, now: Instant) {
        self.inner
            .write()
            .retain(|_, stored| now.duration_since(stored.seen) < self.ttl);
    }

    pub fn get(&self, id: &AgentId) -> Option<NodeDescriptor> {
        self.inner.read().get(id).map(|stored| stored.desc.clone())
    }

    /// The peer that last flooded us this agent's descriptor.
    pub fn via(&self, id: &AgentId) -> Option<AgentId> {
        self.inner.read().get(id).map(|stored| stored.via)
    }

    pub fn known_agents(&self) -> Vec<AgentId> {
        self.inner.read().keys().copied().collect()
    }

    /// Agents advertising a given forward exit key.
    pub fn forward_exit_for(
        &self,
        key: &str,
        management_secret: Option<&x25519_dalek::StaticSecret>,
    ) -> Option<AgentId> {
        let inner = self.inner.read();
        for (id, stored) in inner.iter() {
            let desc = &stored.desc;
            let sensitive = match (desc.sensitive.as_ref(), desc.sealed.as_ref(), management_secret) {
                (Some(s), _, _) => Some(s.clone()),
                (None, Some(_), Some(secret)) => desc.unseal(secret).ok().flatten(),
                _ => None,
            };
            if let Some(s) = sensitive {
                if s.forward_exits.iter().any(|k| k == key) {
                    return Some(*id);
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: AgentId, version: u64) -> NodeDescriptor {
        NodeDescriptor {
            agent_id: id,
            display_name: "n".into(),
            version,
            roles: vec![Role::Transit],
            exit_routes: vec![],
            sensitive: Some(SensitiveInfo {
                hostname: "host-1".into(),
                ..Default::default()
            }),
            sealed: None,
            path: vec![],
        }
    }

    #[test]
    fn test_version_supersession() {
        let own = AgentId([1; 16]);
        let store = NodeInfoStore::new(own, Duration::from_secs(600));
        let other = AgentId([2; 16]);
        let via = AgentId([3; 16]);
        let now = Instant::now();

        assert!(store.accept(descriptor(other, 1), via, now).is_some());
        // Same version re-flood is a no-op.
        assert!(store.accept(descriptor(other, 1), via, now).is_none());
        // Older version is suppressed.
        assert!(store.accept(descriptor(other, 0), via, now).is_none());
        // Newer version supersedes.
        assert!(store.accept(descriptor(other, 2), via, now).is_some());
        assert_eq!(store.get(&other).unwrap().version, 2);
        assert_eq!(store.via(&other), Some(via));
    }

    #[test]
    fn test_flood_loop_suppression() {
        let own = AgentId([1; 16]);
        let store = NodeInfoStore::new(own, Duration::from_secs(600));
        let mut desc = descriptor(AgentId([2; 16]), 1);
        desc.path = vec![AgentId([2; 16]), own];
        assert!(store.accept(desc, AgentId([3; 16]), Instant::now()).is_none());
    }

    #[test]
    fn test_reflood_appends_own_id() {
        let own = AgentId([1; 16]);
        let store = NodeInfoStore::new(own, Duration::from_secs(600));
        let refloods = store
            .accept(descriptor(AgentId([2; 16]), 1), AgentId([3; 16]), Instant::now())
            .unwrap();
        assert_eq!(refloods.path, vec![own]);
    }

    #[test]
    fn test_own_descriptor_ignored() {
        let own = AgentId([1; 16]);
        let store = NodeInfoStore::new(own, Duration::from_secs(600));
        assert!(store
            .accept(descriptor(own, 5), AgentId([3; 16]), Instant::now())
            .is_none());
    }

    #[test]
    fn test_seal_unseal_descriptor() {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
        let public = x25519_dalek::PublicKey::from(&secret);

        let desc = descriptor(AgentId([2; 16]), 1).sealed_for(&public).unwrap();
        assert!(desc.sensitive.is_none());
        assert!(desc.sealed.is_some());

        let sensitive = desc.unseal(&secret).unwrap().unwrap();
        assert_eq!(sensitive.hostname, "host-1");

        let wrong = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
        assert!(desc.unseal(&wrong).is_err());
    }

    #[test]
    fn test_expiry() {
        let own = AgentId([1; 16]);
        let store = NodeInfoStore::new(own, Duration::from_secs(600));
        let now = Instant::now();
        store.accept(descriptor(AgentId([2; 16]), 1), AgentId([3; 16]), now);
        store.expire(now + Duration::from_secs(601));
        assert!(store.is_empty());
    }
}
