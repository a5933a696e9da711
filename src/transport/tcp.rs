//! Listen/dial and the per-connection read loop.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::ControlMessage;
use crate::error::Result;
use crate::framing::{Frame, FrameDecoder};
use crate::handshake;

use super::{PeerHandle, PeerTable, TransportEvent};

/// Translates a listen address with an empty host (`":3000"`, the
/// documented default and the form every `spec.md` §8 scenario dials) into a
/// concrete wildcard address Rust's `ToSocketAddrs` will actually bind.
/// Unlike Go's `net.Listen`, an empty host is not itself a valid
/// `SocketAddr`, so `":3000"` is rewritten to `"0.0.0.0:3000"` before
/// binding; any address that already names a host is passed through
/// unchanged.
fn bindable_address(listen_address: &str) -> String {
    match listen_address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen_address.to_string(),
    }
}

/// Binds `listen_address` and spawns a task that accepts connections
/// forever, handshaking and registering each one in `peers` before handing
/// its frame stream off to [`read_loop`]. Returns once bound; the accept
/// loop itself runs in the background for the life of the process.
pub async fn listen(
    listen_address: &str,
    local_node_id: String,
    auth_token: Vec<u8>,
    peers: Arc<PeerTable>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let listener = TcpListener::bind(bindable_address(listen_address)).await?;
    let bound = listener.local_addr()?;
    info!(%bound, "peervault transport listening");

    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let peers = peers.clone();
            let events = events.clone();
            let local_node_id = local_node_id.clone();
            let auth_token = auth_token.clone();

            tokio::spawn(async move {
                let peer_addr = addr.to_string();
                if let Err(e) =
                    accept_connection(stream, peer_addr.clone(), local_node_id, auth_token, peers.clone(), events.clone())
                        .await
                {
                    debug!(peer = %peer_addr, error = %e, "inbound connection ended");
                    peers.remove(&peer_addr).await;
                    let _ = events.send(TransportEvent::Disconnected { addr: peer_addr }).await;
                }
            });
        }
    });

    Ok(())
}

async fn accept_connection(
    stream: TcpStream,
    peer_addr: String,
    local_node_id: String,
    auth_token: Vec<u8>,
    peers: Arc<PeerTable>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let mut stream = stream;
    let now = chrono::Utc::now().timestamp();
    let remote_node_id = handshake::accept(&mut stream, &local_node_id, &auth_token, now).await?;
    register_and_run(stream, peer_addr, remote_node_id, peers, events).await
}

/// Dials `addr`, performs the handshake as the initiating side, registers
/// the resulting peer in `peers`, and spawns its read loop.
pub async fn connect(
    addr: &str,
    local_node_id: String,
    auth_token: Vec<u8>,
    peers: Arc<PeerTable>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let mut stream = stream;
    let now = chrono::Utc::now().timestamp();
    let remote_node_id = handshake::initiate(&mut stream, &local_node_id, &auth_token, now).await?;
    let peer_addr = addr.to_string();
    register_and_run(stream, peer_addr, remote_node_id, peers, events).await
}

async fn register_and_run(
    stream: TcpStream,
    peer_addr: String,
    remote_node_id: String,
    peers: Arc<PeerTable>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let handle = Arc::new(PeerHandle {
        node_id: remote_node_id,
        writer: tokio::sync::Mutex::new(write_half),
    });
    peers.insert(peer_addr.clone(), handle).await;

    read_loop(read_half, peer_addr, events).await
}

/// Decodes frames from `reader` forever, publishing control messages and
/// stream bytes to `events`. A `Frame::Message` carrying a `StoreFile` or a
/// `GetFileAck{has_file: true}` sets the expectation that the very next
/// frame is a `StreamAnnounce` followed by exactly that many raw bytes —
/// the sender never interleaves an unrelated control message in between
/// (`spec.md` §9, "ack before streaming").
async fn read_loop(
    mut reader: ReadHalf<TcpStream>,
    peer_addr: String,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let mut pending_stream_size: Option<u64> = None;

    loop {
        let frame = FrameDecoder::decode(&mut reader).await?;
        match frame {
            Frame::Message(payload) => {
                let message = ControlMessage::decode(&payload)?;
                pending_stream_size = expected_stream_size(&message);
                if events
                    .send(TransportEvent::Control {
                        from: peer_addr.clone(),
                        message,
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
            Frame::StreamAnnounce => {
                let size = pending_stream_size.take().unwrap_or(0) as usize;
                let mut data = vec![0u8; size];
                reader.read_exact(&mut data).await?;
                if events
                    .send(TransportEvent::Stream {
                        from: peer_addr.clone(),
                        data,
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

fn expected_stream_size(message: &ControlMessage) -> Option<u64> {
    match message {
        ControlMessage::StoreFile { size, .. } => Some(*size),
        ControlMessage::GetFileAck {
            has_file: true,
            file_size,
            ..
        } => Some(*file_size),
        _ => None,
    }
}
