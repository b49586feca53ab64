use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::block_picker::BlockTracker;
use crate::config::NodeMode;
use crate::metainfo::{Digest, FileMetadata};
use crate::peers::client::ExchangeClient;
use crate::prelude::*;
use crate::storage;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("file is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("file digest is {actual}, expected {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("failed to read downloaded file: {0}")]
    Io(#[from] std::io::Error),
}

/// checks the assembled file against the whole-file size and digest in the metadata.
pub async fn validate_download(
    path: impl AsRef<Path>,
    metadata: &FileMetadata,
) -> Result<(), ValidationError> {
    let path = path.as_ref();

    let actual = storage::file_size(path).await?;
    if actual != metadata.file_size {
        return Err(ValidationError::SizeMismatch {
            expected: metadata.file_size,
            actual,
        });
    }

    let actual = storage::hash_file(path).await?;
    if actual != metadata.file_hash {
        return Err(ValidationError::DigestMismatch {
            expected: metadata.file_hash.clone(),
            actual,
        });
    }

    Ok(())
}

/// summary of a finished download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub file_name: String,
    pub file_size: u64,
    pub total_blocks: usize,
    pub block_size: u64,
    pub elapsed: Duration,
    pub file_hash: Digest,
}

impl DownloadReport {
    fn new(metadata: &FileMetadata, elapsed: Duration) -> Self {
        Self {
            file_name: metadata.file_name.clone(),
            file_size: metadata.file_size,
            total_blocks: metadata.total_blocks,
            block_size: metadata.block_size,
            elapsed,
            file_hash: metadata.file_hash.clone(),
        }
    }

    pub fn size_mib(&self) -> f64 {
        self.file_size as f64 / MIB
    }

    /// MiB/s, 0 when no time was measured.
    pub fn throughput_mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.size_mib() / secs
        }
    }

    fn log(&self) {
        info!("download complete");
        info!("  file:       {}", self.file_name);
        info!("  size:       {} bytes ({:.2} MiB)", self.file_size, self.size_mib());
        info!("  blocks:     {} x {} bytes", self.total_blocks, self.block_size);
        info!("  time:       {:.2?}", self.elapsed);
        info!("  throughput: {:.2} MiB/s", self.throughput_mib_per_sec());
        info!("  digest:     {}", self.file_hash);
    }
}

/// Runs the download to the end, then decides whether the node may start seeding.
pub(super) struct CompletionWatcher {
    pub client: ExchangeClient,
    pub tracker: Arc<BlockTracker>,
    pub metadata: Arc<FileMetadata>,
    pub file_path: PathBuf,
    pub mode: Arc<watch::Sender<NodeMode>>,
    pub started_at: Instant,
}

impl CompletionWatcher {
    #[instrument(level = "info", name = "completion watcher", skip_all)]
    pub async fn run(self) -> Option<DownloadReport> {
        let reports = self.client.run().await;
        for report in &reports {
            debug!(
                neighbor = %report.neighbor,
                exit = ?report.exit,
                blocks_fetched = report.blocks_fetched,
                "worker report"
            );
        }

        if !self.tracker.is_complete() {
            warn!(
                "all download workers stopped with {} of {} blocks still missing",
                self.tracker.missing_count(),
                self.tracker.total_blocks()
            );
            return None;
        }

        info!("all blocks received, validating file");
        if let Err(err) = validate_download(&self.file_path, &self.metadata).await {
            error!("downloaded file failed validation: {err}");
            return None;
        }

        self.mode.send_replace(NodeMode::Seeder);
        info!("switched to seeder mode");

        let report = DownloadReport::new(&self.metadata, self.started_at.elapsed());
        report.log();
        Some(report)
    }
}
