//! TCP transport: peer table, connection lifecycle, and the frame
//! dispatch loop shared by dialed and accepted connections.
//!
//! Trimmed from the teacher's transport layer down to a single plain-TCP
//! path: no TLS, no connection pooling, no circuit breaker, no health
//! monitor. Those exist in the teacher to keep a long-lived Bluetooth mesh
//! alive across flaky links; PeerVault's peers are stable cluster members
//! reached over ordinary TCP, and redial/backoff is the fileserver's concern
//! (retried per-broadcast), not the transport's.

pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};

use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::framing::FrameWriter;

/// Events the transport layer delivers to the fileserver's dispatch loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded control message from `from` (the peer's table key, i.e.
    /// its dial/listen address).
    Control { from: String, message: ControlMessage },
    /// The raw bytes of a stream previously announced on this connection.
    Stream { from: String, data: Vec<u8> },
    /// The connection to `addr` was closed or failed.
    Disconnected { addr: String },
}

/// A connected peer's write side, serialized behind a mutex so control
/// messages and stream bytes never interleave mid-frame.
pub struct PeerHandle {
    pub node_id: String,
    writer: Mutex<WriteHalf<TcpStream>>,
}

impl PeerHandle {
    pub async fn send_message(&self, msg: &ControlMessage) -> Result<()> {
        let mut w = self.writer.lock().await;
        FrameWriter::write_message(&mut *w, &msg.encode()).await
    }

    pub async fn send_stream(&self, data: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        FrameWriter::write_stream_header(&mut *w).await?;
        w.write_all(data).await.map_err(Error::Io)?;
        w.flush().await.map_err(Error::Io)?;
        Ok(())
    }
}

/// The set of currently connected peers, keyed by the address used to reach
/// them (bootstrap address for outbound, observed peer address for inbound).
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, Arc<PeerHandle>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, addr: String, handle: Arc<PeerHandle>) {
        self.peers.write().await.insert(addr, handle);
    }

    pub async fn remove(&self, addr: &str) {
        self.peers.write().await.remove(addr);
    }

    pub async fn get(&self, addr: &str) -> Option<Arc<PeerHandle>> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// A consistent point-in-time snapshot of connected peers, taken under
    /// the read lock and then released, so broadcast sends never hold the
    /// table lock while writing to a socket (`spec.md` §4.5).
    pub async fn snapshot(&self) -> Vec<(String, Arc<PeerHandle>)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
