use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{Neighbor, NodeMode, PartialConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "share a file between peers, block by block", long_about = None)]
pub struct Cli {
    /// more output, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// run a peer node until the download finishes or ctrl-c
    Peer(PeerArgs),

    /// split a file into blocks and write its metadata
    Metadata {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value_t = 1024 * 1024)]
        block_size: u64,

        /// defaults to `<file>.meta.json`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// write a synthetic test file, and optionally its metadata
    Generate {
        #[arg(short, long)]
        output: PathBuf,

        /// e.g. 512B, 10KB, 1MB, 2GB
        #[arg(short, long)]
        size: String,

        #[arg(short, long, default_value_t = 1024)]
        block_size: u64,

        #[arg(short, long)]
        metadata: Option<PathBuf>,
    },
}

/// every flag overrides the same setting of the `--config` file.
#[derive(Args, Debug, Default)]
pub struct PeerArgs {
    /// json config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub id: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(short, long, value_enum)]
    pub mode: Option<NodeMode>,

    /// the complete file, for a seeder
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    #[arg(long)]
    pub metadata: Option<PathBuf>,

    #[arg(short, long)]
    pub download_dir: Option<PathBuf>,

    /// ip:port of a neighbor, repeatable
    #[arg(short, long = "neighbor")]
    pub neighbors: Vec<Neighbor>,

    /// append logs to this file instead of stdout
    #[arg(long)]
    pub log: Option<PathBuf>,
}

impl PeerArgs {
    pub fn overrides(&self) -> PartialConfig {
        PartialConfig {
            peer_id: self.id.clone(),
            listen_port: self.port,
            mode: self.mode,
            file_path: self.file.clone(),
            metadata_path: self.metadata.clone(),
            download_dir: self.download_dir.clone(),
            neighbors: self.neighbors.clone(),
            log_file: self.log.clone(),
            retry: None,
        }
    }

    /// the `--config` file, if any, with the flags laid over it.
    pub fn resolve(&self) -> anyhow::Result<PartialConfig> {
        let base = match &self.config {
            Some(path) => PartialConfig::from_json_file(path)?,
            None => PartialConfig::default(),
        };
        Ok(base.merge(self.overrides()))
    }
}
