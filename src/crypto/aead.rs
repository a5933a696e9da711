//! AES-256-GCM stream encryption of on-disk blobs.
//!
//! Layout written by `encrypt_stream` and expected by `decrypt_stream`:
//! `[nonce:12][ciphertext:N][tag:16]`. GCM cannot release authenticated
//! plaintext before the final tag check, so both directions buffer the full
//! plaintext/ciphertext in memory and perform a single AEAD call rather than
//! chunking (`spec.md` §9).

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Reads `src` to end, seals it under `key` with a fresh random nonce, and
/// writes `nonce || ciphertext_with_tag` to `dst`. Returns the number of
/// bytes written (`plaintext.len() + 28`).
pub fn encrypt_stream<R: Read, W: Write>(key: &[u8; 32], src: &mut R, dst: &mut W) -> Result<u64> {
    let mut plaintext = Vec::new();
    src.read_to_end(&mut plaintext)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| Error::AuthFailed)?;

    dst.write_all(&nonce_bytes)?;
    dst.write_all(&ciphertext)?;

    Ok((NONCE_LEN + ciphertext.len()) as u64)
}

/// Reads `nonce || ciphertext_with_tag` from `src`, verifies and opens it
/// under `key`, and writes the plaintext to `dst`. Returns the number of
/// plaintext bytes written.
///
/// Fails with `Error::Truncated` if `src` is shorter than `NONCE_LEN +
/// TAG_LEN` (28 bytes — an empty plaintext still produces exactly that many
/// bytes), or `Error::AuthFailed` if the tag does not verify.
pub fn decrypt_stream<R: Read, W: Write>(key: &[u8; 32], src: &mut R, dst: &mut W) -> Result<u64> {
    let mut buf = Vec::new();
    src.read_to_end(&mut buf)?;

    if buf.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Truncated);
    }

    let (nonce_bytes, ciphertext) = buf.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::AuthFailed)?;

    dst.write_all(&plaintext)?;
    Ok(plaintext.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let mut encrypted = Vec::new();
        encrypt_stream(key, &mut Cursor::new(plaintext), &mut encrypted).unwrap();
        let mut decrypted = Vec::new();
        decrypt_stream(key, &mut Cursor::new(encrypted), &mut decrypted).unwrap();
        decrypted
    }

    #[test]
    fn round_trip_preserves_plaintext() {
        let key = [9u8; 32];
        for msg in [&b""[..], b"hello", &[0xABu8; 1024][..]] {
            assert_eq!(roundtrip(&key, msg), msg);
        }
    }

    #[test]
    fn empty_plaintext_produces_28_byte_file() {
        let key = [1u8; 32];
        let mut encrypted = Vec::new();
        encrypt_stream(&key, &mut Cursor::new(b""), &mut encrypted).unwrap();
        assert_eq!(encrypted.len(), 28);
    }

    #[test]
    fn short_file_fails_truncated() {
        let key = [1u8; 32];
        let mut out = Vec::new();
        let short = vec![0u8; 27];
        let err = decrypt_stream(&key, &mut Cursor::new(short), &mut out).unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let key = [1u8; 32];
        let other_key = [2u8; 32];
        let mut encrypted = Vec::new();
        encrypt_stream(&key, &mut Cursor::new(b"secret"), &mut encrypted).unwrap();

        let mut out = Vec::new();
        let err = decrypt_stream(&other_key, &mut Cursor::new(encrypted), &mut out).unwrap_err();
        assert!(matches!(err, Error::AuthFailed));
    }

    #[test]
    fn flipped_bit_fails_auth() {
        let key = [5u8; 32];
        let mut encrypted = Vec::new();
        encrypt_stream(&key, &mut Cursor::new(b"tamper me"), &mut encrypted).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;

        let mut out = Vec::new();
        let err = decrypt_stream(&key, &mut Cursor::new(encrypted), &mut out).unwrap_err();
        assert!(matches!(err, Error::AuthFailed));
    }

    #[test]
    fn nonces_are_unique_across_many_encrypts() {
        let key = [3u8; 32];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let mut out = Vec::new();
            encrypt_stream(&key, &mut Cursor::new(b"x"), &mut out).unwrap();
            let nonce = out[..NONCE_LEN].to_vec();
            assert!(seen.insert(nonce), "nonce reused");
        }
        assert_eq!(seen.len(), 10_000);
    }
}
