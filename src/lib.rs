//! PeerVault — a peer-to-peer content-addressed file store.
//!
//! Nodes connect over authenticated TCP, exchange a length-prefixed binary
//! framed protocol, and replicate AES-256-GCM-encrypted file blobs among
//! peers. The public surface is `Server`: construct it from `Options`,
//! `start()` it to bind and dial bootstrap peers, then call `store`/`get`.

pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod fileserver;
pub mod framing;
pub mod handshake;
pub mod resource;
pub mod store;
pub mod transport;

pub use config::Options;
pub use error::{Error, Result};
pub use fileserver::Server;
