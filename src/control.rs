//! Control-message codec carried inside message frames (`framing::Frame::Message`).
//!
//! Manual TLV-ish binary layout in the style of the teacher's
//! `protocol::binary::BinaryProtocol`: a one-byte discriminant followed by
//! fixed-then-variable fields, all integers big-endian via `byteorder`.
//! Unknown trailing bytes after a known message are ignored; an unknown
//! discriminant is rejected.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

const TAG_STORE_FILE: u8 = 0x01;
const TAG_STORE_FILE_ACK: u8 = 0x02;
const TAG_GET_FILE: u8 = 0x03;
const TAG_GET_FILE_ACK: u8 = 0x04;

/// Control messages exchanged between peers over the framed protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Announces that the sender is about to stream a file for `hashed_key`.
    StoreFile {
        request_id: u64,
        hashed_key: String,
        size: u64,
    },
    /// Acknowledges a `StoreFile`, before the stream begins.
    StoreFileAck {
        request_id: u64,
        hashed_key: String,
        success: bool,
        error: Option<String>,
    },
    /// Requests a file by `hashed_key`.
    GetFile {
        request_id: u64,
        hashed_key: String,
    },
    /// Acknowledges a `GetFile`. If `has_file`, a stream-announce frame and
    /// the file bytes follow immediately on the same connection.
    GetFileAck {
        request_id: u64,
        hashed_key: String,
        has_file: bool,
        file_size: u64,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ControlMessage::StoreFile {
                request_id,
                hashed_key,
                size,
            } => {
                buf.write_u8(TAG_STORE_FILE).unwrap();
                buf.write_u64::<BigEndian>(*request_id).unwrap();
                write_str(&mut buf, hashed_key);
                buf.write_u64::<BigEndian>(*size).unwrap();
            }
            ControlMessage::StoreFileAck {
                request_id,
                hashed_key,
                success,
                error,
            } => {
                buf.write_u8(TAG_STORE_FILE_ACK).unwrap();
                buf.write_u64::<BigEndian>(*request_id).unwrap();
                write_str(&mut buf, hashed_key);
                buf.write_u8(if *success { 1 } else { 0 }).unwrap();
                write_str(&mut buf, error.as_deref().unwrap_or(""));
            }
            ControlMessage::GetFile {
                request_id,
                hashed_key,
            } => {
                buf.write_u8(TAG_GET_FILE).unwrap();
                buf.write_u64::<BigEndian>(*request_id).unwrap();
                write_str(&mut buf, hashed_key);
            }
            ControlMessage::GetFileAck {
                request_id,
                hashed_key,
                has_file,
                file_size,
            } => {
                buf.write_u8(TAG_GET_FILE_ACK).unwrap();
                buf.write_u64::<BigEndian>(*request_id).unwrap();
                write_str(&mut buf, hashed_key);
                buf.write_u8(if *has_file { 1 } else { 0 }).unwrap();
                buf.write_u64::<BigEndian>(*file_size).unwrap();
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let tag = cursor.read_u8()?;
        match tag {
            TAG_STORE_FILE => {
                let request_id = cursor.read_u64::<BigEndian>()?;
                let hashed_key = read_str(&mut cursor)?;
                let size = cursor.read_u64::<BigEndian>()?;
                Ok(ControlMessage::StoreFile {
                    request_id,
                    hashed_key,
                    size,
                })
            }
            TAG_STORE_FILE_ACK => {
                let request_id = cursor.read_u64::<BigEndian>()?;
                let hashed_key = read_str(&mut cursor)?;
                let success = cursor.read_u8()? != 0;
                let error_str = read_str(&mut cursor)?;
                let error = if error_str.is_empty() { None } else { Some(error_str) };
                Ok(ControlMessage::StoreFileAck {
                    request_id,
                    hashed_key,
                    success,
                    error,
                })
            }
            TAG_GET_FILE => {
                let request_id = cursor.read_u64::<BigEndian>()?;
                let hashed_key = read_str(&mut cursor)?;
                Ok(ControlMessage::GetFile {
                    request_id,
                    hashed_key,
                })
            }
            TAG_GET_FILE_ACK => {
                let request_id = cursor.read_u64::<BigEndian>()?;
                let hashed_key = read_str(&mut cursor)?;
                let has_file = cursor.read_u8()? != 0;
                let file_size = cursor.read_u64::<BigEndian>()?;
                Ok(ControlMessage::GetFileAck {
                    request_id,
                    hashed_key,
                    has_file,
                    file_size,
                })
            }
            other => Err(Error::Decode(format!("unknown control message tag {other}"))),
        }
    }

    /// A new random request identifier for an outbound message (`spec.md` §5).
    pub fn next_request_id() -> u64 {
        rand::random()
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
    buf.extend_from_slice(bytes);
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| Error::Decode(format!("non-utf8 string field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ControlMessage) {
        let encoded = msg.encode();
        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn store_file_round_trip() {
        round_trip(ControlMessage::StoreFile {
            request_id: 42,
            hashed_key: "deadbeef".into(),
            size: 1024,
        });
    }

    #[test]
    fn store_file_ack_round_trip_with_and_without_error() {
        round_trip(ControlMessage::StoreFileAck {
            request_id: 1,
            hashed_key: "abc".into(),
            success: true,
            error: None,
        });
        round_trip(ControlMessage::StoreFileAck {
            request_id: 2,
            hashed_key: "abc".into(),
            success: false,
            error: Some("disk full".into()),
        });
    }

    #[test]
    fn get_file_and_ack_round_trip() {
        round_trip(ControlMessage::GetFile {
            request_id: 7,
            hashed_key: "feedface".into(),
        });
        round_trip(ControlMessage::GetFileAck {
            request_id: 7,
            hashed_key: "feedface".into(),
            has_file: true,
            file_size: 2048,
        });
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = ControlMessage::decode(&[0xFF]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn request_ids_are_randomized() {
        let a = ControlMessage::next_request_id();
        let b = ControlMessage::next_request_id();
        assert_ne!(a, b);
    }
}
