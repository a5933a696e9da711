//! Per-peer resource accounting: concurrent-stream caps, a token-bucket rate
//! limiter, and cancellation propagation for in-flight streams.
//!
//! Grounded in the teacher's transport layer's use of semaphores for
//! backpressure, generalized to per-peer scope and paired with
//! `tokio_util::sync::CancellationToken` for coordinated shutdown (the same
//! primitive used elsewhere in the retrieved example pack for exactly this
//! parent/child cancellation shape).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Hand-rolled token bucket: refills continuously at `rate` tokens/sec, caps
/// at `burst` tokens. No crate in the teacher's stack provides this, so it
/// is implemented directly rather than adding a dependency for it.
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn try_take(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Per-peer resource state: a semaphore bounding concurrent streams and a
/// rate limiter bounding request throughput.
struct PeerResources {
    streams: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
    cancel: CancellationToken,
}

/// Tracks and enforces per-peer resource limits across the whole node.
pub struct ResourceManager {
    max_concurrent_streams: usize,
    rate: f64,
    burst: u32,
    stream_timeout: Duration,
    root_cancel: CancellationToken,
    peers: Mutex<HashMap<String, Arc<PeerResources>>>,
}

/// Held while a stream is in flight; releases its semaphore permit on drop
/// and exposes the stream's deadline-bound cancellation token.
pub struct StreamGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    pub cancel: CancellationToken,
}

impl ResourceManager {
    pub fn new(max_concurrent_streams: usize, rate: f64, burst: u32, stream_timeout: Duration) -> Self {
        Self {
            max_concurrent_streams,
            rate,
            burst,
            stream_timeout,
            root_cancel: CancellationToken::new(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    async fn peer_resources(&self, peer_addr: &str) -> Arc<PeerResources> {
        let mut peers = self.peers.lock().await;
        peers
            .entry(peer_addr.to_string())
            .or_insert_with(|| {
                Arc::new(PeerResources {
                    streams: Arc::new(Semaphore::new(self.max_concurrent_streams)),
                    bucket: Mutex::new(TokenBucket::new(self.rate, self.burst)),
                    cancel: self.root_cancel.child_token(),
                })
            })
            .clone()
    }

    /// Checks the peer's rate limiter for one request token. Does not block;
    /// returns `Error::RateLimited` immediately if exhausted.
    pub async fn check_rate(&self, peer_addr: &str) -> Result<()> {
        if self.root_cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let res = self.peer_resources(peer_addr).await;
        let mut bucket = res.bucket.lock().await;
        if bucket.try_take(1.0) {
            Ok(())
        } else {
            Err(Error::RateLimited)
        }
    }

    /// Acquires a concurrent-stream slot for `peer_addr`, returning a guard
    /// that releases it on drop and carries a cancellation token scoped to
    /// `stream_timeout` and to node shutdown.
    pub async fn acquire_stream(&self, peer_addr: &str) -> Result<StreamGuard> {
        if self.root_cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let res = self.peer_resources(peer_addr).await;
        let permit = res
            .streams
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::LimitExceeded)?;

        let cancel = res.cancel.child_token();
        let timeout_cancel = cancel.clone();
        let timeout = self.stream_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timeout_cancel.cancel(),
                _ = timeout_cancel.cancelled() => {}
            }
        });

        Ok(StreamGuard {
            _permit: permit,
            cancel,
        })
    }

    /// Cancels every in-flight stream, across every peer, and prevents new
    /// acquisitions.
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_concurrent_stream_cap_per_peer() {
        let rm = ResourceManager::new(2, 1000.0, 1000, Duration::from_secs(60));
        let g1 = rm.acquire_stream("peer-a").await.unwrap();
        let g2 = rm.acquire_stream("peer-a").await.unwrap();
        let err = rm.acquire_stream("peer-a").await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded));

        drop(g1);
        let g3 = rm.acquire_stream("peer-a").await.unwrap();
        drop(g2);
        drop(g3);
    }

    #[tokio::test]
    async fn peers_have_independent_caps() {
        let rm = ResourceManager::new(1, 1000.0, 1000, Duration::from_secs(60));
        let _a = rm.acquire_stream("peer-a").await.unwrap();
        let _b = rm.acquire_stream("peer-b").await.unwrap();
    }

    #[tokio::test]
    async fn rate_limiter_exhausts_and_refills() {
        let rm = ResourceManager::new(10, 2.0, 2, Duration::from_secs(60));
        assert!(rm.check_rate("peer-a").await.is_ok());
        assert!(rm.check_rate("peer-a").await.is_ok());
        assert!(rm.check_rate("peer-a").await.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rm.check_rate("peer-a").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_streams() {
        let rm = ResourceManager::new(4, 1000.0, 1000, Duration::from_secs(60));
        let guard = rm.acquire_stream("peer-a").await.unwrap();
        assert!(!guard.cancel.is_cancelled());
        rm.shutdown();
        assert!(guard.cancel.is_cancelled());

        let err = rm.acquire_stream("peer-b").await.unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }
}
