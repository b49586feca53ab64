//! Node configuration, assembled from an optional json file and command line overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid neighbor {0:?}, expected host:port")]
    InvalidNeighbor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// holds the complete file and only serves it
    Seeder,
    /// downloads missing blocks from neighbors while serving the ones it already has
    Leecher,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seeder => f.write_str("seeder"),
            Self::Leecher => f.write_str("leecher"),
        }
    }
}

/// network endpoint of another peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Neighbor {
    pub ip: String,
    pub port: u16,
}

impl Neighbor {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> (&str, u16) {
        (&self.ip, self.port)
    }
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Neighbor {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNeighbor(raw.to_owned());

        let (ip, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        if ip.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;

        Ok(Self::new(ip, port))
    }
}

/// Connection retry and request backoff timings used by every download worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub connect_attempts: u32,
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_backoff_ms", with = "millis")]
    pub request_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            request_backoff: Duration::from_millis(100),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// everything the node needs at construction.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub peer_id: String,
    pub listen_port: u16,
    pub mode: NodeMode,
    /// the complete file, seeders only
    pub file_path: Option<PathBuf>,
    pub metadata_path: PathBuf,
    /// where a leecher assembles the file
    pub download_dir: PathBuf,
    pub neighbors: Vec<Neighbor>,
    pub retry: RetryPolicy,
}

pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";

/// Config as written in a json file or given on the command line, every setting optional.
/// Layers are combined with [`PartialConfig::merge`] and then checked by
/// [`PartialConfig::into_config`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub peer_id: Option<String>,
    pub listen_port: Option<u16>,
    pub mode: Option<NodeMode>,
    pub file_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub neighbors: Vec<Neighbor>,
    pub log_file: Option<PathBuf>,
    pub retry: Option<RetryPolicy>,
}

impl PartialConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// settings present in `overrides` win. neighbors are replaced as a whole when any are given.
    pub fn merge(self, overrides: PartialConfig) -> PartialConfig {
        PartialConfig {
            peer_id: overrides.peer_id.or(self.peer_id),
            listen_port: overrides.listen_port.or(self.listen_port),
            mode: overrides.mode.or(self.mode),
            file_path: overrides.file_path.or(self.file_path),
            metadata_path: overrides.metadata_path.or(self.metadata_path),
            download_dir: overrides.download_dir.or(self.download_dir),
            neighbors: if overrides.neighbors.is_empty() {
                self.neighbors
            } else {
                overrides.neighbors
            },
            log_file: overrides.log_file.or(self.log_file),
            retry: overrides.retry.or(self.retry),
        }
    }

    pub fn into_config(self) -> Result<NodeConfig, ConfigError> {
        let mode = self.mode.ok_or(ConfigError::Missing("mode"))?;
        if mode == NodeMode::Seeder && self.file_path.is_none() {
            return Err(ConfigError::Missing("file_path"));
        }

        Ok(NodeConfig {
            peer_id: self.peer_id.unwrap_or_else(random_peer_id),
            listen_port: self.listen_port.ok_or(ConfigError::Missing("listen_port"))?,
            mode,
            file_path: self.file_path,
            metadata_path: self
                .metadata_path
                .ok_or(ConfigError::Missing("metadata_path"))?,
            download_dir: self
                .download_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            neighbors: self.neighbors,
            retry: self.retry.unwrap_or_default(),
        })
    }
}

fn random_peer_id() -> String {
    format!("peer-{:08x}", rand::random::<u32>())
}
