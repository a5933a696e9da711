//! PeerVault CLI: parses flags and environment overrides into `Options`,
//! starts a `Server`, and waits for a shutdown signal.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use peervault::{Options, Result, Server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on, e.g. ":3000" or "0.0.0.0:3000".
    #[arg(short, long, default_value = ":3000")]
    listen: String,

    /// Bootstrap peer addresses to dial on startup, may be repeated.
    #[arg(short, long = "bootstrap")]
    bootstrap_addresses: Vec<String>,

    /// Directory to store encrypted blobs in. Defaults to a path derived
    /// from the listen address under the OS data directory.
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Maximum number of concurrent streams accepted from a single peer.
    #[arg(long, default_value_t = 3)]
    max_concurrent_streams: usize,

    /// Maximum accepted file size, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    max_file_size: u64,

    /// Log filter, e.g. "info" or "peervault=debug".
    #[arg(short, long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.verbosity))
        .init();

    let options = Options {
        listen_address: args.listen,
        bootstrap_addresses: args.bootstrap_addresses,
        storage_root: args.storage_root,
        max_concurrent_streams: args.max_concurrent_streams,
        max_file_size: args.max_file_size,
        ..Options::default()
    }
    .with_env_overrides()?;

    if options.auth_token.is_empty() {
        tracing::warn!("PEERVAULT_AUTH_TOKEN is not set; peers will fail the handshake");
    }

    let server = Server::new(options).await?;
    server.start().await?;

    tracing::info!(node_id = %server.node_id(), "peervault ready");

    tokio::signal::ctrl_c().await.map_err(peervault::Error::Io)?;
    tracing::info!("shutting down");
    server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}
