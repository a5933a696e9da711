//! Cryptographic primitives for PeerVault.
//!
//! - Node identity and content-key hashing (`generate_id`, `hash_key`).
//! - Cluster-key-derived AEAD key management with rotation (`KeyManager`).
//! - Streaming AEAD encrypt/decrypt of on-disk blobs (`aead`).

pub mod aead;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Salt used to derive the initial cluster-wide encryption key.
const CLUSTER_SALT: &[u8] = b"peervault-cluster-salt-v1";

/// Default key rotation period (`spec.md` §4.1).
pub const DEFAULT_ROTATION_PERIOD: std::time::Duration = std::time::Duration::from_secs(24 * 3600);

/// Generate a random 32-byte node identity, hex-encoded.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of the UTF-8 bytes of `s`, hex-encoded — the "hashed key" used as
/// the sole identifier on disk and on the wire.
pub fn hash_key(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

fn hmac_derive(cluster_key: &[u8; 32], salt: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(cluster_key).expect("HMAC accepts any key length");
    mac.update(salt);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&out);
    key
}

fn key_id(derived: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(derived);
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Derives and rotates the shared AEAD key from a process-wide cluster
/// secret. Reads of the current key are lock-free; rotation takes a brief
/// write lock and swaps the key atomically, keeping the immediately-prior
/// key around so recently-written blobs keep decrypting after a rotation
/// (`spec.md` §9, "Key rotation hazard").
pub struct KeyManager {
    cluster_key: ClusterKey,
    inner: std::sync::RwLock<KeyState>,
    rotation_period: std::time::Duration,
}

#[derive(zeroize::ZeroizeOnDrop)]
struct ClusterKey([u8; 32]);

#[derive(zeroize::ZeroizeOnDrop)]
struct KeyState {
    current: [u8; 32],
    #[zeroize(skip)]
    current_id: String,
    previous: Option<[u8; 32]>,
    #[zeroize(skip)]
    derived_at: std::time::Instant,
}

impl KeyManager {
    /// Loads the cluster key from `cluster_key_opt`, or generates a fresh
    /// random 32-byte key if none was supplied, then derives the initial
    /// encryption key.
    pub fn new(cluster_key_opt: Option<[u8; 32]>) -> Self {
        Self::with_rotation_period(cluster_key_opt, DEFAULT_ROTATION_PERIOD)
    }

    pub fn with_rotation_period(
        cluster_key_opt: Option<[u8; 32]>,
        rotation_period: std::time::Duration,
    ) -> Self {
        let cluster_key = cluster_key_opt.unwrap_or_else(|| {
            let mut k = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut k);
            k
        });
        let current = hmac_derive(&cluster_key, CLUSTER_SALT);
        let current_id = key_id(&current);
        Self {
            cluster_key: ClusterKey(cluster_key),
            inner: std::sync::RwLock::new(KeyState {
                current,
                current_id,
                previous: None,
                derived_at: std::time::Instant::now(),
            }),
            rotation_period,
        }
    }

    /// The 32-byte key currently used for new encryptions.
    pub fn encryption_key(&self) -> [u8; 32] {
        self.inner.read().expect("key manager lock poisoned").current
    }

    /// The key that was current immediately before the last rotation, if any.
    /// Consulted as a fallback when decryption under the current key fails.
    pub fn previous_key(&self) -> Option<[u8; 32]> {
        self.inner.read().expect("key manager lock poisoned").previous
    }

    /// Hex-encoded identifier of the current derived key.
    pub fn key_id(&self) -> String {
        self.inner.read().expect("key manager lock poisoned").current_id.clone()
    }

    /// True once the current key is older than the rotation period.
    pub fn should_rotate(&self) -> bool {
        let state = self.inner.read().expect("key manager lock poisoned");
        state.derived_at.elapsed() >= self.rotation_period
    }

    /// Re-derives the key from `cluster_key || salt || today's UTC date`,
    /// keeping the outgoing key as the fallback for decrypts.
    pub fn rotate(&self) {
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut salt = CLUSTER_SALT.to_vec();
        salt.extend_from_slice(date.as_bytes());
        let new_key = hmac_derive(&self.cluster_key.0, &salt);
        let new_id = key_id(&new_key);

        let mut state = self.inner.write().expect("key manager lock poisoned");
        state.previous = Some(state.current);
        state.current = new_key;
        state.current_id = new_id;
        state.derived_at = std::time::Instant::now();
    }
}

/// Opens a sealed blob (`aead::encrypt_stream`'s output) received from a
/// peer, trying the current derived key first and falling back to the
/// immediately-prior one. Used on replication ingest, where the sender's
/// and receiver's rotation schedules are not guaranteed to be in lockstep
/// even though both derive from the same cluster key.
pub fn decrypt_with_fallback(keys: &KeyManager, sealed: &[u8]) -> Result<Vec<u8>> {
    let current = keys.encryption_key();
    let mut out = Vec::new();
    match aead::decrypt_stream(&current, &mut std::io::Cursor::new(sealed), &mut out) {
        Ok(_) => Ok(out),
        Err(Error::AuthFailed) => {
            let previous = keys.previous_key().ok_or(Error::AuthFailed)?;
            out.clear();
            aead::decrypt_stream(&previous, &mut std::io::Cursor::new(sealed), &mut out)?;
            Ok(out)
        }
        Err(e) => Err(e),
    }
}

/// Verifies an HMAC-SHA256 tag over `message` against `token` in constant
/// time, for the handshake signature check.
pub fn hmac_verify(token: &[u8], message: &[u8], expected: &[u8]) -> bool {
    let mut mac = match HmacSha256::new_from_slice(token) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(message);
    mac.verify_slice(expected).is_ok()
}

/// Computes an HMAC-SHA256 tag over `message` with `token`.
pub fn hmac_sign(token: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(token).expect("HMAC accepts any key length");
    mac.update(message);
    let out = mac.finalize().into_bytes();
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&out);
    tag
}
