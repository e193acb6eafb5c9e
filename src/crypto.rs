//! Crypto primitives: HKDF subkeys, AEAD chunks, sealed blobs, signed commands
//!
//! The stream layer derives per-direction ChaCha20-Poly1305 keys from an
//! X25519 shared secret via HKDF-SHA256. Management-only node-info fields are
//! sealed under the mesh management public key with an ephemeral X25519 key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::identity::AgentId;
use crate::WeftError;

/// AEAD tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// One direction of a derived stream cipher: a key plus a nonce seed.
///
/// The chunk nonce is the seed with its low 8 bytes XORed against a
/// monotonically increasing counter.
pub struct DirectionKey {
    cipher: ChaCha20Poly1305,
    nonce_seed: [u8; NONCE_LEN],
}

impl DirectionKey {
    fn nonce_for(&self, counter: u64) -> Nonce {
        let mut nonce = self.nonce_seed;
        for (i, byte) in counter.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= byte;
        }
        Nonce::from(nonce)
    }

    /// Encrypt one chunk under the given counter. Output is ciphertext
    /// followed by the 16-byte tag.
    pub fn seal_chunk(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, WeftError> {
        self.cipher
            .encrypt(&self.nonce_for(counter), plaintext)
            .map_err(|_| WeftError::Integrity)
    }

    /// Decrypt one chunk. Fails on tag mismatch.
    pub fn open_chunk(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, WeftError> {
        self.cipher
            .decrypt(&self.nonce_for(counter), ciphertext)
            .map_err(|_| WeftError::Integrity)
    }
}

/// Derive the two per-direction keys for an end-to-end encrypted stream.
///
/// Direction labels are fixed by role: the opener transmits under
/// `weft e2e o2t`, the terminator under `weft e2e t2o`. Both sides derive
/// both keys from the same shared secret; `is_opener` picks which one each
/// uses for sending.
pub fn derive_stream_keys(
    shared_secret: &[u8; 32],
    is_opener: bool,
) -> Result<(DirectionKey, DirectionKey), WeftError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let o2t = expand_direction(&hk, b"weft e2e o2t")?;
    let t2o = expand_direction(&hk, b"weft e2e t2o")?;
    // (send, recv)
    if is_opener {
        Ok((o2t, t2o))
    } else {
        Ok((t2o, o2t))
    }
}

fn expand_direction(hk: &Hkdf<Sha256>, label: &[u8]) -> Result<DirectionKey, WeftError> {
    let mut okm = [0u8; 32 + NONCE_LEN];
    hk.expand(label, &mut okm)
        .map_err(|_| WeftError::Integrity)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..32]));
    let mut nonce_seed = [0u8; NONCE_LEN];
    nonce_seed.copy_from_slice(&okm[32..]);
    Ok(DirectionKey { cipher, nonce_seed })
}

/// A blob sealed to a recipient public key: ephemeral X25519 + AEAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// Sender's ephemeral public key, base64.
    pub eph_pub: String,
    /// Ciphertext with trailing tag, base64.
    pub ciphertext: String,
}

const SEAL_LABEL: &[u8] = b"weft seal v1";

/// Seal `plaintext` so only the holder of the private half of `recipient`
/// can read it.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<SealedBlob, WeftError> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let eph = EphemeralSecret::random_from_rng(rand::thread_rng());
    let eph_pub = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(recipient);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let key = expand_direction(&hk, SEAL_LABEL)?;
    let ct = key.seal_chunk(0, plaintext)?;
    Ok(SealedBlob {
        eph_pub: BASE64.encode(eph_pub.as_bytes()),
        ciphertext: BASE64.encode(ct),
    })
}

/// Open a sealed blob with the recipient's static secret.
pub fn open_sealed(
    blob: &SealedBlob,
    recipient_secret: &x25519_dalek::StaticSecret,
) -> Result<Vec<u8>, WeftError> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let eph_raw = BASE64
        .decode(&blob.eph_pub)
        .map_err(|_| WeftError::Integrity)?;
    let eph_bytes: [u8; 32] = eph_raw[..].try_into().map_err(|_| WeftError::Integrity)?;
    let shared = recipient_secret.diffie_hellman(&PublicKey::from(eph_bytes));

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let key = expand_direction(&hk, SEAL_LABEL)?;
    let ct = BASE64
        .decode(&blob.ciphertext)
        .map_err(|_| WeftError::Integrity)?;
    key.open_chunk(0, &ct)
}

/// A sleep/wake command, optionally Ed25519-signed over
/// `{command, issuer, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommand {
    pub command: String,
    pub issuer: AgentId,
    /// Unix seconds.
    pub timestamp: u64,
    /// Signature over the canonical signing input, base64. Absent only when
    /// the mesh has no signing key configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl SignedCommand {
    fn signing_input(&self) -> Vec<u8> {
        let mut input = Vec::with_capacity(self.command.len() + 16 + 8);
        input.extend_from_slice(self.command.as_bytes());
        input.extend_from_slice(self.issuer.as_bytes());
        input.extend_from_slice(&self.timestamp.to_be_bytes());
        input
    }

    pub fn new_signed(
        command: &str,
        issuer: AgentId,
        key: &ed25519_dalek::SigningKey,
    ) -> Self {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        use ed25519_dalek::Signer;

        let mut cmd = Self {
            command: command.to_string(),
            issuer,
            timestamp: unix_now(),
            signature: None,
        };
        let sig = key.sign(&cmd.signing_input());
        cmd.signature = Some(BASE64.encode(sig.to_bytes()));
        cmd
    }

    pub fn new_unsigned(command: &str, issuer: AgentId) -> Self {
        Self {
            command: command.to_string(),
            issuer,
            timestamp: unix_now(),
            signature: None,
        }
    }

    /// Verify against the configured verifying key. Unsigned commands are
    /// accepted only when no key is configured.
    pub fn verify(&self, key: Option<&ed25519_dalek::VerifyingKey>) -> Result<(), WeftError> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        use ed25519_dalek::Verifier;

        match (key, &self.signature) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(WeftError::Unauthorized("unsigned command".into())),
            (Some(key), Some(sig_b64)) => {
                let raw = BASE64
                    .decode(sig_b64)
                    .map_err(|_| WeftError::Unauthorized("malformed signature".into()))?;
                let sig_bytes: [u8; 64] = raw[..]
                    .try_into()
                    .map_err(|_| WeftError::Unauthorized("malformed signature".into()))?;
                let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                key.verify(&self.signing_input(), &sig)
                    .map_err(|_| WeftError::Unauthorized("bad command signature".into()))
            }
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Constant-time equality for secrets and fingerprints.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn shared_pair() -> ([u8; 32], [u8; 32]) {
        let a = StaticSecret::random_from_rng(rand::thread_rng());
        let b = StaticSecret::random_from_rng(rand::thread_rng());
        let ab = *a.diffie_hellman(&PublicKey::from(&b)).as_bytes();
        let ba = *b.diffie_hellman(&PublicKey::from(&a)).as_bytes();
        (ab, ba)
    }

    #[test]
    fn test_chunk_roundtrip() {
        let (s, _) = shared_pair();
        let (opener_send, _) = derive_stream_keys(&s, true).unwrap();
        let (_, term_recv) = derive_stream_keys(&s, false).unwrap();

        let ct = opener_send.seal_chunk(0, b"hello mesh").unwrap();
        assert_eq!(ct.len(), 10 + TAG_LEN);
        assert_eq!(term_recv.open_chunk(0, &ct).unwrap(), b"hello mesh");
    }

    #[test]
    fn test_chunk_counter_binds_nonce() {
        let (s, _) = shared_pair();
        let (send, _) = derive_stream_keys(&s, true).unwrap();
        let (_, recv) = derive_stream_keys(&s, false).unwrap();

        let ct = send.seal_chunk(3, b"payload").unwrap();
        assert!(recv.open_chunk(4, &ct).is_err());
        assert!(recv.open_chunk(3, &ct).is_ok());
    }

    #[test]
    fn test_tampered_chunk_fails() {
        let (s, _) = shared_pair();
        let (send, _) = derive_stream_keys(&s, true).unwrap();
        let (_, recv) = derive_stream_keys(&s, false).unwrap();

        let mut ct = send.seal_chunk(0, b"payload").unwrap();
        ct[2] ^= 0x01;
        assert!(recv.open_chunk(0, &ct).is_err());
    }

    #[test]
    fn test_directions_are_independent() {
        let (s, _) = shared_pair();
        let (opener_send, opener_recv) = derive_stream_keys(&s, true).unwrap();
        let ct = opener_send.seal_chunk(0, b"x").unwrap();
        // The opener's receive key must not accept its own transmissions.
        assert!(opener_recv.open_chunk(0, &ct).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = StaticSecret::random_from_rng(rand::thread_rng());
        let blob = seal(b"operator eyes only", &PublicKey::from(&recipient)).unwrap();
        let opened = open_sealed(&blob, &recipient).unwrap();
        assert_eq!(opened, b"operator eyes only");
    }

    #[test]
    fn test_seal_wrong_key_fails() {
        let recipient = StaticSecret::random_from_rng(rand::thread_rng());
        let other = StaticSecret::random_from_rng(rand::thread_rng());
        let blob = seal(b"secret", &PublicKey::from(&recipient)).unwrap();
        assert!(open_sealed(&blob, &other).is_err());
    }

    #[test]
    fn test_signed_command_verify() {
        let key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let issuer = AgentId::generate();
        let cmd = SignedCommand::new_signed("sleep", issuer, &key);

        assert!(cmd.verify(Some(&key.verifying_key())).is_ok());

        let other = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        assert!(cmd.verify(Some(&other.verifying_key())).is_err());
    }

    #[test]
    fn test_unsigned_command_policy() {
        let issuer = AgentId::generate();
        let cmd = SignedCommand::new_unsigned("wake", issuer);
        // Accepted without a configured key, rejected with one.
        assert!(cmd.verify(None).is_ok());
        let key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        assert!(cmd.verify(Some(&key.verifying_key())).is_err());
    }
}
