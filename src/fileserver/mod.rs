//! Ties transport, store, crypto, and resource accounting into the public
//! `Store`/`Get` operations (`spec.md` §2, §5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Options;
use crate::control::ControlMessage;
use crate::crypto::{generate_id, KeyManager};
use crate::error::{Error, Result};
use crate::resource::{ResourceManager, StreamGuard};
use crate::store::Store;
use crate::transport::{tcp, PeerTable, TransportEvent};

const STORE_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const GET_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_STREAM_RETRIES: u32 = 3;

/// Per-peer bookkeeping the dispatch loop uses to route the raw bytes that
/// follow a stream-announce frame back to the right consumer. All of it
/// lives on the single dispatch task, so there is no race between recording
/// an expectation and a frame that satisfies it (`spec.md` §9).
/// A single accepted `StoreFile` announcement, still waiting for its
/// stream-announce frame and bytes to arrive. Holds the concurrent-stream
/// slot until it is popped (on arrival) or the peer disconnects.
struct PendingStoreStream {
    hashed_key: String,
    size: u64,
    _guard: StreamGuard,
}

#[derive(Default)]
struct Routing {
    /// peer addr -> FIFO queue of get() request_ids whose streams are
    /// expected next, in the order this node sent the matching `GetFile`s
    /// (concurrent `get()` calls to the same peer are answered in request
    /// order, same reasoning as `awaiting_store_stream`).
    awaiting_get_stream: HashMap<String, VecDeque<u64>>,
    /// peer addr -> FIFO queue of accepted `StoreFile` announcements whose
    /// stream bytes have not yet arrived. A peer's single connection
    /// delivers streams in the same order it announced them, so each
    /// arriving stream is matched to the oldest outstanding announcement
    /// (`spec.md` §5, stream ordering per connection).
    awaiting_store_stream: HashMap<String, VecDeque<PendingStoreStream>>,
    /// (request_id, peer addr) -> the store() caller awaiting this peer's ack.
    store_acks: HashMap<(u64, String), oneshot::Sender<bool>>,
    /// request_id -> the get() caller awaiting the winning peer's bytes.
    get_streams: HashMap<u64, oneshot::Sender<Vec<u8>>>,
}

/// A running PeerVault node: the TCP listener, bootstrap connections, and
/// the dispatch loop that answers `StoreFile`/`GetFile` from peers while
/// serving local `store`/`get` calls.
pub struct Server {
    options: Options,
    local_node_id: String,
    store: Arc<Store>,
    keys: Arc<KeyManager>,
    resources: Arc<ResourceManager>,
    peers: Arc<PeerTable>,
    events_tx: mpsc::Sender<TransportEvent>,
    routing: Arc<Mutex<Routing>>,
}

impl Server {
    /// Opens the local store and prepares (but does not yet bind) a node
    /// with the given `options`.
    pub async fn new(options: Options) -> Result<Self> {
        let storage_root = options.resolved_storage_root();
        let store = Store::open(storage_root).await?;
        let keys = KeyManager::with_rotation_period(options.cluster_key, options.key_rotation_period);
        let resources = ResourceManager::new(
            options.max_concurrent_streams,
            options.rate,
            options.burst,
            options.stream_timeout,
        );
        let (events_tx, events_rx) = mpsc::channel(options.control_channel_capacity);

        let server = Self {
            local_node_id: generate_id(),
            store: Arc::new(store),
            keys: Arc::new(keys),
            resources: Arc::new(resources),
            peers: Arc::new(PeerTable::new()),
            events_tx,
            routing: Arc::new(Mutex::new(Routing::default())),
            options,
        };

        server.spawn_dispatch_loop(events_rx);
        Ok(server)
    }

    /// Binds the listen address and dials every bootstrap peer. Bootstrap
    /// failures are logged, not fatal — a node can start isolated and pick
    /// up peers later.
    pub async fn start(&self) -> Result<()> {
        tcp::listen(
            &self.options.listen_address,
            self.local_node_id.clone(),
            self.options.auth_token.as_bytes().to_vec(),
            self.peers.clone(),
            self.events_tx.clone(),
        )
        .await?;

        for addr in &self.options.bootstrap_addresses {
            if let Err(e) = tcp::connect(
                addr,
                self.local_node_id.clone(),
                self.options.auth_token.as_bytes().to_vec(),
                self.peers.clone(),
                self.events_tx.clone(),
            )
            .await
            {
                warn!(%addr, error = %e, "bootstrap connect failed");
            }
        }

        info!(node_id = %self.local_node_id, "peervault node started");
        Ok(())
    }

    /// Cancels all in-flight streams and stops admitting new ones. Does not
    /// close existing TCP sockets; dropping the `Server` does that.
    pub fn stop(&self) {
        self.resources.shutdown();
    }

    pub fn node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Stores `data` under `key`: writes it to the local encrypted store,
    /// then replicates the sealed on-disk bytes to every connected peer
    /// verbatim (no peer ever sees the plaintext over the wire). Succeeds iff
    /// there are no peers, or at least one peer accepted the replica; with
    /// one or more peers and zero successful replications, returns the first
    /// per-peer error (`spec.md` §4.7 step 5, §7).
    pub async fn store(&self, key: &str, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.options.max_file_size {
            return Err(Error::SizeLimitExceeded);
        }

        let (hashed_key, _) = self.store.write(key, data, &self.keys).await?;

        let peers = self.peers.snapshot().await;
        if peers.is_empty() {
            return Ok(());
        }

        // Replicate the on-disk ciphertext verbatim (`spec.md` §4.7): the
        // receiving peer decrypts and re-encrypts under its own key on
        // ingest, so the sender never needs the plaintext again here.
        let sealed = self.store.read_sealed_digest(&hashed_key).await?;

        let mut replicated = 0usize;
        let mut first_error: Option<Error> = None;
        let mut tasks = Vec::with_capacity(peers.len());
        for (addr, _handle) in peers {
            let peers = self.peers.clone();
            let routing = self.routing.clone();
            let hashed_key = hashed_key.clone();
            let sealed = sealed.clone();
            tasks.push(tokio::spawn(async move {
                replicate_to_peer(peers, routing, addr, hashed_key, sealed).await
            }));
        }
        for task in tasks {
            match task.await {
                Ok(Ok(())) => replicated += 1,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(Error::Io(std::io::Error::other(e)));
                    }
                }
            }
        }

        if replicated == 0 {
            let err = first_error.unwrap_or(Error::Timeout);
            warn!(key, error = %err, "store replicated to zero peers");
            return Err(err);
        }
        Ok(())
    }

    /// Retrieves `data` for `key`: serves from the local store if present,
    /// otherwise broadcasts a `GetFile` and takes the first peer's sealed
    /// bytes to arrive, decrypting and re-sealing them under the local key
    /// before returning the plaintext (`spec.md` §5, §9).
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        if self.store.has(key).await {
            return self.store.read(key, &self.keys).await;
        }

        let hashed_key = crate::crypto::hash_key(key);
        let peers = self.peers.snapshot().await;
        if peers.is_empty() {
            return Err(Error::NotFound);
        }

        let request_id = ControlMessage::next_request_id();
        let (tx, rx) = oneshot::channel();
        self.routing.lock().await.get_streams.insert(request_id, tx);

        for (_addr, handle) in &peers {
            let msg = ControlMessage::GetFile {
                request_id,
                hashed_key: hashed_key.clone(),
            };
            if let Err(e) = handle.send_message(&msg).await {
                debug!(peer = %_addr, error = %e, "get broadcast send failed");
            }
        }

        let sealed = match tokio::time::timeout(GET_TIMEOUT, rx).await {
            Ok(Ok(sealed)) => sealed,
            _ => {
                self.routing.lock().await.get_streams.remove(&request_id);
                return Err(Error::NotFound);
            }
        };

        // The bytes that arrived are the peer's on-disk ciphertext, sealed
        // under its own key. Decrypt, then persist under ours (`spec.md`
        // §4.7, "re-encrypted-at-rest under the local key").
        let plaintext = crate::crypto::decrypt_with_fallback(&self.keys, &sealed)?;
        self.store.write_digest(&hashed_key, &plaintext, &self.keys).await?;
        Ok(plaintext)
    }

    fn spawn_dispatch_loop(&self, mut events_rx: mpsc::Receiver<TransportEvent>) {
        let store = self.store.clone();
        let keys = self.keys.clone();
        let peers = self.peers.clone();
        let routing = self.routing.clone();
        let resources = self.resources.clone();
        let max_file_size = self.options.max_file_size;

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    TransportEvent::Control { from, message } => {
                        if resources.check_rate(&from).await.is_err() {
                            debug!(peer = %from, "rate limited control message");
                            continue;
                        }
                        handle_control(&store, &keys, &peers, &routing, &resources, max_file_size, from, message)
                            .await;
                    }
                    TransportEvent::Stream { from, data } => {
                        handle_stream(&store, &keys, &routing, from, data).await;
                    }
                    TransportEvent::Disconnected { addr } => {
                        let mut routing = routing.lock().await;
                        routing.awaiting_get_stream.remove(&addr);
                        routing.awaiting_store_stream.remove(&addr);
                        debug!(peer = %addr, "peer disconnected");
                    }
                }
            }
        });
    }
}

async fn handle_control(
    store: &Store,
    keys: &KeyManager,
    peers: &PeerTable,
    routing: &Mutex<Routing>,
    resources: &ResourceManager,
    max_file_size: u64,
    from: String,
    message: ControlMessage,
) {
    match message {
        ControlMessage::StoreFile {
            request_id,
            hashed_key,
            size,
        } => {
            let (accept, reject_reason) = if size > max_file_size {
                (false, Some("file exceeds configured maximum size".to_string()))
            } else {
                match resources.acquire_stream(&from).await {
                    Ok(guard) => {
                        let mut routing = routing.lock().await;
                        routing
                            .awaiting_store_stream
                            .entry(from.clone())
                            .or_default()
                            .push_back(PendingStoreStream {
                                hashed_key: hashed_key.clone(),
                                size,
                                _guard: guard,
                            });
                        (true, None)
                    }
                    Err(e) => (false, Some(e.to_string())),
                }
            };
            if let Some(handle) = peers.get(&from).await {
                let ack = ControlMessage::StoreFileAck {
                    request_id,
                    hashed_key,
                    success: accept,
                    error: reject_reason,
                };
                if let Err(e) = handle.send_message(&ack).await {
                    warn!(peer = %from, error = %e, "failed to send StoreFileAck");
                }
            }
        }
        ControlMessage::StoreFileAck {
            request_id,
            success,
            ..
        } => {
            let tx = routing.lock().await.store_acks.remove(&(request_id, from));
            if let Some(tx) = tx {
                let _ = tx.send(success);
            }
        }
        ControlMessage::GetFile {
            request_id,
            hashed_key,
        } => {
            let Some(handle) = peers.get(&from).await else {
                return;
            };
            // Stream the on-disk ciphertext verbatim; the requester decrypts
            // and re-seals under its own key on ingest (`spec.md` §4.7).
            match store.read_sealed_digest(&hashed_key).await {
                Ok(sealed) => {
                    let _guard = match resources.acquire_stream(&from).await {
                        Ok(guard) => guard,
                        Err(e) => {
                            debug!(peer = %from, error = %e, "dropping GetFile reply, no stream slot");
                            let ack = ControlMessage::GetFileAck {
                                request_id,
                                hashed_key,
                                has_file: false,
                                file_size: 0,
                            };
                            let _ = handle.send_message(&ack).await;
                            return;
                        }
                    };
                    let ack = ControlMessage::GetFileAck {
                        request_id,
                        hashed_key,
                        has_file: true,
                        file_size: sealed.len() as u64,
                    };
                    if let Err(e) = handle.send_message(&ack).await {
                        warn!(peer = %from, error = %e, "failed to send GetFileAck");
                        return;
                    }
                    if let Err(e) = handle.send_stream(&sealed).await {
                        warn!(peer = %from, error = %e, "failed to stream file to requester");
                    }
                }
                Err(_) => {
                    let ack = ControlMessage::GetFileAck {
                        request_id,
                        hashed_key,
                        has_file: false,
                        file_size: 0,
                    };
                    let _ = handle.send_message(&ack).await;
                }
            }
        }
        ControlMessage::GetFileAck {
            request_id,
            has_file,
            ..
        } => {
            if has_file {
                routing
                    .lock()
                    .await
                    .awaiting_get_stream
                    .entry(from)
                    .or_default()
                    .push_back(request_id);
            }
        }
    }
}

async fn handle_stream(store: &Store, keys: &KeyManager, routing: &Mutex<Routing>, from: String, data: Vec<u8>) {
    let get_request = {
        let mut routing = routing.lock().await;
        routing
            .awaiting_get_stream
            .get_mut(&from)
            .and_then(VecDeque::pop_front)
    };
    if let Some(request_id) = get_request {
        let tx = routing.lock().await.get_streams.remove(&request_id);
        if let Some(tx) = tx {
            let _ = tx.send(data);
        }
        return;
    }

    let store_expect = {
        let mut routing = routing.lock().await;
        routing
            .awaiting_store_stream
            .get_mut(&from)
            .and_then(VecDeque::pop_front)
    };
    if let Some(PendingStoreStream { hashed_key, size: expected_size, .. }) = store_expect {
        if data.len() as u64 != expected_size {
            warn!(peer = %from, "stream size mismatch, discarding replica");
            return;
        }
        // `data` is the sender's ciphertext; decrypt (falling back to our
        // previous key, since rotation schedules need not be in lockstep)
        // then re-seal under our own current key (`spec.md` §4.7).
        let plaintext = match crate::crypto::decrypt_with_fallback(keys, &data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                error!(peer = %from, error = %e, "failed to decrypt replicated file");
                return;
            }
        };
        if let Err(e) = store.write_digest(&hashed_key, &plaintext, keys).await {
            error!(peer = %from, error = %e, "failed to persist replicated file");
        }
        return;
    }

    debug!(peer = %from, "stream with no registered consumer, discarding");
}

async fn replicate_to_peer(
    peers: Arc<PeerTable>,
    routing: Arc<Mutex<Routing>>,
    addr: String,
    hashed_key: String,
    data: Vec<u8>,
) -> Result<()> {
    for attempt in 1..=MAX_STREAM_RETRIES {
        let Some(handle) = peers.get(&addr).await else {
            return Err(Error::UnknownPeer(addr));
        };

        let request_id = ControlMessage::next_request_id();
        let (tx, rx) = oneshot::channel();
        routing.lock().await.store_acks.insert((request_id, addr.clone()), tx);

        let msg = ControlMessage::StoreFile {
            request_id,
            hashed_key: hashed_key.clone(),
            size: data.len() as u64,
        };
        if handle.send_message(&msg).await.is_err() {
            routing.lock().await.store_acks.remove(&(request_id, addr.clone()));
            continue;
        }

        let acked = match tokio::time::timeout(STORE_ACK_TIMEOUT, rx).await {
            Ok(Ok(success)) => success,
            _ => {
                routing.lock().await.store_acks.remove(&(request_id, addr.clone()));
                false
            }
        };

        if acked && handle.send_stream(&data).await.is_ok() {
            return Ok(());
        }

        debug!(peer = %addr, attempt, "replication attempt failed, retrying");
    }
    Err(Error::Timeout)
}
