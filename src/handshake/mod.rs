//! Authenticated handshake exchanged immediately after TCP connect.
//!
//! Wire layout: `[node_id_len:u16 BE][node_id][timestamp:i64 BE][sig_len:u16
//! BE][sig:sig_len]`. The signature is always 32 bytes (HMAC-SHA256 output),
//! but `sig_len` is still carried on the wire per `spec.md` §3/§6 so the
//! frame is bit-exact with a spec-conformant peer. The signature itself is
//! `HMAC-SHA256(auth_token, node_id || timestamp_be_bytes)`. A peer is
//! rejected if the tag does not verify, or if `timestamp` falls outside a
//! ±30 second window of the verifier's own clock (`spec.md` §4.3).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{hmac_sign, hmac_verify};
use crate::error::{Error, Result};

/// Allowed clock skew between handshake parties.
pub const MAX_SKEW_SECS: i64 = 30;

/// A handshake message as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub node_id: String,
    pub timestamp: i64,
    pub signature: [u8; 32],
}

impl HandshakeMessage {
    /// Builds and signs a handshake message for `node_id` at `timestamp`
    /// using the shared `auth_token`.
    pub fn sign(node_id: &str, timestamp: i64, auth_token: &[u8]) -> Self {
        let signature = hmac_sign(auth_token, &signed_bytes(node_id, timestamp));
        Self {
            node_id: node_id.to_string(),
            timestamp,
            signature,
        }
    }

    /// Verifies this message's signature and timestamp skew against
    /// `auth_token` and `now`. Returns `Ok(())` on success.
    pub fn verify(&self, auth_token: &[u8], now: i64) -> Result<()> {
        if (now - self.timestamp).abs() > MAX_SKEW_SECS {
            return Err(Error::Stale);
        }
        let expected = signed_bytes(&self.node_id, self.timestamp);
        if !hmac_verify(auth_token, &expected, &self.signature) {
            return Err(Error::AuthFailed);
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let id_bytes = self.node_id.as_bytes();
        let mut out = Vec::with_capacity(2 + id_bytes.len() + 8 + 2 + 32);
        out.write_u16::<BigEndian>(id_bytes.len() as u16).unwrap();
        out.extend_from_slice(id_bytes);
        out.write_i64::<BigEndian>(self.timestamp).unwrap();
        out.write_u16::<BigEndian>(self.signature.len() as u16).unwrap();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        if cursor.len() < 2 {
            return Err(Error::Decode("handshake message too short".into()));
        }
        let id_len = cursor.read_u16::<BigEndian>()? as usize;
        if cursor.len() < id_len + 8 + 2 {
            return Err(Error::Decode("handshake message truncated".into()));
        }
        let (id_bytes, rest) = cursor.split_at(id_len);
        let node_id = String::from_utf8(id_bytes.to_vec())
            .map_err(|e| Error::Decode(format!("node id is not utf-8: {e}")))?;
        let mut rest = rest;
        let timestamp = rest.read_i64::<BigEndian>()?;
        let sig_len = rest.read_u16::<BigEndian>()? as usize;
        if sig_len != 32 {
            return Err(Error::Decode(format!(
                "handshake signature must be 32 bytes, got sig_len={sig_len}"
            )));
        }
        if rest.len() != sig_len {
            return Err(Error::Decode("handshake signature length mismatch".into()));
        }
        let mut signature = [0u8; 32];
        signature.copy_from_slice(rest);
        Ok(Self {
            node_id,
            timestamp,
            signature,
        })
    }

    /// Writes this message to `writer` as a length-prefixed blob:
    /// `[total_len:u16 BE][encoded]` (`spec.md` §4.3/§6).
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let encoded = self.encode();
        writer.write_u16::<BigEndian>(encoded.len() as u16).await?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a handshake message previously written by `write_to`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let len = reader.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Self::decode(&buf)
    }
}

fn signed_bytes(node_id: &str, timestamp: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(node_id.len() + 8);
    buf.extend_from_slice(node_id.as_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Performs the handshake as the dialing side: send our signed message, then
/// read and verify the remote's.
pub async fn initiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_node_id: &str,
    auth_token: &[u8],
    now: i64,
) -> Result<String> {
    let outbound = HandshakeMessage::sign(local_node_id, now, auth_token);
    outbound.write_to(stream).await?;

    let inbound = HandshakeMessage::read_from(stream).await?;
    inbound.verify(auth_token, now)?;
    Ok(inbound.node_id)
}

/// Performs the handshake as the accepting side: read and verify the
/// remote's message first, then reply with our own.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_node_id: &str,
    auth_token: &[u8],
    now: i64,
) -> Result<String> {
    let inbound = HandshakeMessage::read_from(stream).await?;
    inbound.verify(auth_token, now)?;

    let outbound = HandshakeMessage::sign(local_node_id, now, auth_token);
    outbound.write_to(stream).await?;
    Ok(inbound.node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn encode_decode_round_trip() {
        let msg = HandshakeMessage::sign("node-a", 1_700_000_000, b"token");
        let encoded = msg.encode();
        let decoded = HandshakeMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    /// Locks in the bit-exact layout from `spec.md` §3: `[node_id_len:u16]
    /// [node_id][timestamp:i64][sig_len:u16][sig:32]`, including the
    /// `sig_len` field that sits between the timestamp and the signature.
    #[test]
    fn encoded_layout_carries_an_explicit_sig_len() {
        let msg = HandshakeMessage::sign("ab", 1, b"token");
        let encoded = msg.encode();

        // [id_len:u16=2]["ab"][timestamp:i64=1][sig_len:u16=32][sig:32]
        assert_eq!(encoded.len(), 2 + 2 + 8 + 2 + 32);
        assert_eq!(&encoded[0..2], &2u16.to_be_bytes());
        assert_eq!(&encoded[2..4], b"ab");
        assert_eq!(&encoded[4..12], &1i64.to_be_bytes());
        assert_eq!(&encoded[12..14], &32u16.to_be_bytes());
    }

    #[test]
    fn non_32_sig_len_is_rejected() {
        let msg = HandshakeMessage::sign("node-a", 1, b"token");
        let mut encoded = msg.encode();
        let sig_len_at = encoded.len() - 32 - 2;
        encoded[sig_len_at..sig_len_at + 2].copy_from_slice(&16u16.to_be_bytes());
        let err = HandshakeMessage::decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn correct_token_verifies() {
        let msg = HandshakeMessage::sign("node-a", 1_700_000_000, b"secret-token");
        assert!(msg.verify(b"secret-token", 1_700_000_010).is_ok());
    }

    #[test]
    fn wrong_token_is_rejected() {
        let msg = HandshakeMessage::sign("node-a", 1_700_000_000, b"secret-token");
        let err = msg.verify(b"wrong-token", 1_700_000_010).unwrap_err();
        assert!(matches!(err, Error::AuthFailed));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let msg = HandshakeMessage::sign("node-a", 1_700_000_000, b"secret-token");
        let err = msg.verify(b"secret-token", 1_700_000_000 + MAX_SKEW_SECS + 1).unwrap_err();
        assert!(matches!(err, Error::Stale));
    }

    #[tokio::test]
    async fn initiate_and_accept_agree_on_node_ids() {
        let (mut client, mut server) = duplex(4096);
        let now = 1_700_000_500;

        let client_task = tokio::spawn(async move {
            initiate(&mut client, "client-id", b"shared", now).await
        });
        let server_task = tokio::spawn(async move {
            accept(&mut server, "server-id", b"shared", now).await
        });

        let server_saw = client_task.await.unwrap().unwrap();
        let client_saw = server_task.await.unwrap().unwrap();
        assert_eq!(server_saw, "server-id");
        assert_eq!(client_saw, "client-id");
    }

    #[tokio::test]
    async fn mismatched_tokens_cause_rejection() {
        let (mut client, mut server) = duplex(4096);
        let now = 1_700_000_500;

        let client_task = tokio::spawn(async move {
            initiate(&mut client, "client-id", b"token-a", now).await
        });
        let server_task = tokio::spawn(async move {
            accept(&mut server, "server-id", b"token-b", now).await
        });

        let client_result = client_task.await.unwrap();
        let server_result = server_task.await.unwrap();
        assert!(server_result.is_err());
        assert!(client_result.is_err());
    }
}
