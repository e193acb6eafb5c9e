//! Agent identity: 128-bit IDs and long-term keypairs
//!
//! Every node carries a random 128-bit agent ID and a static X25519 keypair,
//! both generated on first run and persisted under the data directory with
//! 0600 permissions. An optional Ed25519 keypair signs sleep/wake commands.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::WeftError;

const ID_FILE: &str = "agent.id";
const KEY_FILE: &str = "agent.key";

/// Opaque 128-bit agent identifier.
///
/// Rendered as 32 lowercase hex characters. The 8-character short form is
/// for display only and must never be used as a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub [u8; 16]);

impl AgentId {
    /// Generate a fresh random ID from the system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, WeftError> {
        let raw = hex::decode(s.trim())
            .map_err(|_| WeftError::InvalidIdentity(format!("bad agent id: {}", s)))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| WeftError::InvalidIdentity(format!("agent id must be 16 bytes: {}", s)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Display-only short form (first 8 hex chars).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for AgentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AgentId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Persisted key material, stored as JSON with base64-encoded keys.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    x25519_private: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ed25519_private: Option<String>,
}

/// A node's long-term identity.
pub struct Identity {
    pub id: AgentId,
    pub display_name: String,
    secret: StaticSecret,
    public: PublicKey,
    signing: Option<ed25519_dalek::SigningKey>,
}

impl Identity {
    /// Load the identity from `data_dir`, generating and persisting a fresh
    /// one on first run.
    pub fn load_or_create(data_dir: &Path, display_name: &str) -> Result<Self, WeftError> {
        fs::create_dir_all(data_dir)?;

        let id_path = data_dir.join(ID_FILE);
        let id = if id_path.exists() {
            AgentId::from_hex(&fs::read_to_string(&id_path)?)?
        } else {
            let id = AgentId::generate();
            write_private(&id_path, format!("{}\n", id).as_bytes())?;
            log::info!("[IDENTITY] Generated new agent id {}", id);
            id
        };

        let key_path = data_dir.join(KEY_FILE);
        let (secret, signing) = if key_path.exists() {
            let parsed: KeyFile = serde_json::from_str(&fs::read_to_string(&key_path)?)
                .map_err(|e| WeftError::InvalidIdentity(format!("corrupt key file: {}", e)))?;
            let raw = Zeroizing::new(
                BASE64
                    .decode(&parsed.x25519_private)
                    .map_err(|e| WeftError::InvalidIdentity(format!("bad x25519 key: {}", e)))?,
            );
            let bytes: [u8; 32] = raw[..]
                .try_into()
                .map_err(|_| WeftError::InvalidIdentity("x25519 key must be 32 bytes".into()))?;
            let signing = match parsed.ed25519_private {
                Some(ref b64) => {
                    let raw = Zeroizing::new(BASE64.decode(b64).map_err(|e| {
                        WeftError::InvalidIdentity(format!("bad ed25519 key: {}", e))
                    })?);
                    let bytes: [u8; 32] = raw[..].try_into().map_err(|_| {
                        WeftError::InvalidIdentity("ed25519 key must be 32 bytes".into())
                    })?;
                    Some(ed25519_dalek::SigningKey::from_bytes(&bytes))
                }
                None => None,
            };
            (StaticSecret::from(bytes), signing)
        } else {
            let secret = StaticSecret::random_from_rng(rand::thread_rng());
            let file = KeyFile {
                x25519_private: BASE64.encode(secret.to_bytes()),
                ed25519_private: None,
            };
            write_private(&key_path, serde_json::to_string_pretty(&file)?.as_bytes())?;
            log::info!("[IDENTITY] Generated new X25519 keypair");
            (secret, None)
        };

        let public = PublicKey::from(&secret);
        Ok(Self {
            id,
            display_name: display_name.to_string(),
            secret,
            public,
            signing,
        })
    }

    /// Ephemeral identity for tests and in-memory meshes; nothing persisted.
    pub fn ephemeral(display_name: &str) -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            id: AgentId::generate(),
            display_name: display_name.to_string(),
            secret,
            public,
            signing: None,
        }
    }

    /// Ephemeral identity with a fixed ID, for duplicate-resolution tests.
    pub fn ephemeral_with_id(id: AgentId, display_name: &str) -> Self {
        let mut ident = Self::ephemeral(display_name);
        ident.id = id;
        ident
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Diffie-Hellman against a remote static or ephemeral public key.
    pub fn diffie_hellman(&self, remote: &PublicKey) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(remote)
    }

    pub fn signing_key(&self) -> Option<&ed25519_dalek::SigningKey> {
        self.signing.as_ref()
    }
}

/// Write a file with owner-only permissions.
fn write_private(path: &PathBuf, contents: &[u8]) -> Result<(), WeftError> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_hex_roundtrip() {
        let id = AgentId::generate();
        let parsed = AgentId::from_hex(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_agent_id_short_form() {
        let id = AgentId([0xab; 16]);
        assert_eq!(id.short(), "abababab");
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn test_agent_id_rejects_garbage() {
        assert!(AgentId::from_hex("not hex").is_err());
        assert!(AgentId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_identity_persistence() {
        let dir = std::env::temp_dir().join(format!("weft-id-test-{}", std::process::id()));
        let first = Identity::load_or_create(&dir, "node-a").unwrap();
        let second = Identity::load_or_create(&dir, "node-a").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.public_key().as_bytes(), second.public_key().as_bytes());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_shared_secret_agreement() {
        let a = Identity::ephemeral("a");
        let b = Identity::ephemeral("b");
        let ab = a.diffie_hellman(&b.public_key());
        let ba = b.diffie_hellman(&a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }
}
