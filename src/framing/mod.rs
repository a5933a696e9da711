//! Length-prefixed frame protocol: `[type:u8][len:u32 BE][payload:len]`.
//!
//! `type = 0x01` carries a control message; `type = 0x02` announces that the
//! next `N` bytes of the connection (handled out-of-band by the transport's
//! stream reader) form an uninterpreted blob, and MUST carry `len = 0`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum payload size for a message frame (1 MiB).
pub const MAX_FRAME: u32 = 1024 * 1024;

const TYPE_MESSAGE: u8 = 0x01;
const TYPE_STREAM: u8 = 0x02;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A control-message payload.
    Message(Vec<u8>),
    /// A stream-announce marker: the next bytes on the connection are an
    /// uninterpreted stream, consumed separately by the caller.
    StreamAnnounce,
}

/// Writes frames onto an async byte sink. Each `write_*` call emits one
/// frame as a single contiguous write.
pub struct FrameWriter;

impl FrameWriter {
    /// Emits `[0x01][len][payload]`.
    pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > MAX_FRAME as u64 {
            return Err(Error::FrameTooLarge);
        }
        let mut header = Vec::with_capacity(5);
        header.write_u8(TYPE_MESSAGE)?;
        header.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Emits `[0x02][0]`.
    pub async fn write_stream_header<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
        let mut header = Vec::with_capacity(5);
        header.write_u8(TYPE_STREAM)?;
        header.write_u32::<BigEndian>(0)?;
        writer.write_all(&header).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Decodes frames from an async byte source using read-to-fill semantics so
/// partial reads (one byte at a time, or any other split) still compose into
/// a correct decode.
pub struct FrameDecoder;

impl FrameDecoder {
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
        let mut header = [0u8; 5];
        read_exact_or_err(reader, &mut header).await?;

        let frame_type = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);

        if len > MAX_FRAME {
            return Err(Error::FrameTooLarge);
        }

        match frame_type {
            TYPE_MESSAGE => {
                let mut payload = vec![0u8; len as usize];
                read_exact_or_err(reader, &mut payload).await?;
                Ok(Frame::Message(payload))
            }
            TYPE_STREAM => {
                if len != 0 {
                    return Err(Error::Decode(
                        "stream-announce frame must carry len=0".into(),
                    ));
                }
                Ok(Frame::StreamAnnounce)
            }
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

async fn read_exact_or_err<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ShortRead {
                expected: buf.len(),
                actual: 0,
            }
        } else {
            Error::Io(e)
        }
    })?;
    Ok(())
}
