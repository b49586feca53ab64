use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;

use blockswarm::cli::{Cli, Command};
use blockswarm::config::{NodeConfig, NodeMode};
use blockswarm::metainfo::FileMetadata;
use blockswarm::node::PeerNode;
use blockswarm::prelude::*;
use blockswarm::sample_file;

use tracing_subscriber::{filter, fmt, layer::SubscriberExt, registry::Registry, Layer};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    match cli.command {
        Command::Peer(args) => {
            let partial = args.resolve()?;
            init_tracing(cli.verbose, partial.log_file.as_deref())?;
            run_peer(partial.into_config()?).await
        }

        Command::Metadata {
            file,
            block_size,
            output,
        } => {
            init_tracing(cli.verbose, None)?;
            let output = output.unwrap_or_else(|| metadata_path_for(&file));
            write_metadata(&file, block_size, &output).await
        }

        Command::Generate {
            output,
            size,
            block_size,
            metadata,
        } => {
            init_tracing(cli.verbose, None)?;
            let size = sample_file::parse_size(&size)?;
            info!(
                "generating {} ({size} bytes, {:.2} MiB, blocks of {block_size} bytes)",
                output.display(),
                size as f64 / (1024.0 * 1024.0)
            );
            sample_file::write_sample_file(&output, size, block_size)
                .await
                .with_context(|| format!("failed to write {}", output.display()))?;

            let metadata = metadata.unwrap_or_else(|| metadata_path_for(&output));
            write_metadata(&output, block_size, &metadata).await
        }
    }
}

fn init_tracing(verbosity: u8, log_file: Option<&Path>) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => filter::LevelFilter::INFO,
        1 => filter::LevelFilter::DEBUG,
        _ => filter::LevelFilter::TRACE,
    };

    let (stdout_layer, file_layer) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let layer = fmt::Layer::default()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(level);
            (None, Some(layer))
        }
        None => (Some(fmt::Layer::default().with_filter(level)), None),
    };

    let subscriber = Registry::default().with(stdout_layer).with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("could not set global tracing subscriber")
}

async fn run_peer(config: NodeConfig) -> anyhow::Result<()> {
    info!(
        peer_id = %config.peer_id,
        mode = %config.mode,
        port = config.listen_port,
        "starting peer"
    );

    let mut node = PeerNode::new(config).await?;
    node.start().await?;

    let downloading = async {
        node.wait().await;
        if node.mode() == NodeMode::Seeder && node.report().is_some() {
            info!("download complete, now seeding. press ctrl-c to exit");
        }
        // keep serving until interrupted
        std::future::pending::<()>().await
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!("failed to listen for ctrl-c: {err}");
            }
        }
        _ = downloading => {}
    }

    info!("interrupted, shutting down");
    node.stop();
    info!(stats = ?node.stats(), "peer stopped");
    Ok(())
}

async fn write_metadata(file: &Path, block_size: u64, output: &Path) -> anyhow::Result<()> {
    let metadata = FileMetadata::generate(file, block_size)
        .await
        .with_context(|| format!("failed to generate metadata for {}", file.display()))?;
    metadata
        .save(output)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    info!(
        blocks = metadata.total_blocks,
        digest = %metadata.file_hash,
        "metadata written to {}",
        output.display()
    );
    Ok(())
}

/// `<file>.meta.json`
fn metadata_path_for(file: &Path) -> PathBuf {
    let mut path = OsString::from(file.as_os_str());
    path.push(".meta.json");
    PathBuf::from(path)
}
