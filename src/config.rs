//! Runtime configuration: defaults, environment overrides, and an optional
//! TOML file layer, in the teacher's `config` module style.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_CLUSTER_KEY: &str = "PEERVAULT_CLUSTER_KEY";
const ENV_AUTH_TOKEN: &str = "PEERVAULT_AUTH_TOKEN";

/// Node configuration (`spec.md` §6). Constructed from CLI flags in
/// `main.rs`, then layered with environment variables for secrets that
/// should never be passed on the command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub listen_address: String,
    pub bootstrap_addresses: Vec<String>,
    pub storage_root: Option<PathBuf>,
    pub cluster_key: Option<[u8; 32]>,
    pub auth_token: String,
    pub max_concurrent_streams: usize,
    pub stream_timeout: Duration,
    pub rate: f64,
    pub burst: u32,
    pub max_file_size: u64,
    pub control_channel_capacity: usize,
    pub key_rotation_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen_address: ":3000".to_string(),
            bootstrap_addresses: Vec::new(),
            storage_root: None,
            cluster_key: None,
            auth_token: String::new(),
            max_concurrent_streams: 3,
            stream_timeout: Duration::from_secs(5 * 60),
            rate: 50.0,
            burst: 100,
            max_file_size: 64 * 1024 * 1024,
            control_channel_capacity: 1024,
            key_rotation_period: Duration::from_secs(24 * 3600),
        }
    }
}

impl Options {
    /// Applies `PEERVAULT_CLUSTER_KEY` (64 hex chars) and
    /// `PEERVAULT_AUTH_TOKEN` from the environment, if present, overriding
    /// any value already set on `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(hex_key) = std::env::var(ENV_CLUSTER_KEY) {
            self.cluster_key = Some(parse_cluster_key(&hex_key)?);
        }
        if let Ok(token) = std::env::var(ENV_AUTH_TOKEN) {
            self.auth_token = token;
        }
        Ok(self)
    }

    /// Resolves the effective storage root: the configured path, or a
    /// default derived from the listen address under the OS data directory.
    pub fn resolved_storage_root(&self) -> PathBuf {
        match &self.storage_root {
            Some(path) => path.clone(),
            None => {
                let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
                base.join("peervault")
                    .join(crate::store::default_storage_dir_name(&self.listen_address))
            }
        }
    }
}

fn parse_cluster_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::Config(format!("{ENV_CLUSTER_KEY} is not valid hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::Config(format!(
            "{ENV_CLUSTER_KEY} must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// On-disk layering for `Options`, read from a TOML file and merged onto
/// the built-in defaults before environment overrides are applied.
#[derive(Debug, Default, serde::Deserialize)]
pub struct FileConfig {
    pub listen_address: Option<String>,
    pub bootstrap_addresses: Option<Vec<String>>,
    pub storage_root: Option<PathBuf>,
    pub auth_token: Option<String>,
    pub max_concurrent_streams: Option<usize>,
    pub rate: Option<f64>,
    pub burst: Option<u32>,
    pub max_file_size: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("invalid config file: {e}")))
    }

    pub fn apply_to(self, mut options: Options) -> Options {
        if let Some(v) = self.listen_address {
            options.listen_address = v;
        }
        if let Some(v) = self.bootstrap_addresses {
            options.bootstrap_addresses = v;
        }
        if let Some(v) = self.storage_root {
            options.storage_root = Some(v);
        }
        if let Some(v) = self.auth_token {
            options.auth_token = v;
        }
        if let Some(v) = self.max_concurrent_streams {
            options.max_concurrent_streams = v;
        }
        if let Some(v) = self.rate {
            options.rate = v;
        }
        if let Some(v) = self.burst {
            options.burst = v;
        }
        if let Some(v) = self.max_file_size {
            options.max_file_size = v;
        }
        options
    }
}
