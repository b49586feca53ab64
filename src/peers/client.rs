use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::block_picker::BlockTracker;
use crate::config::{Neighbor, RetryPolicy};
use crate::metainfo::FileMetadata;
use crate::prelude::*;

use super::download_worker::{DownloadWorker, WorkerReport};

/// Downloads the missing blocks of a file with one [`DownloadWorker`] per neighbor.
pub struct ExchangeClient {
    workers: Vec<DownloadWorker>,
}

impl ExchangeClient {
    pub fn new(
        neighbors: &[Neighbor],
        tracker: Arc<BlockTracker>,
        metadata: Arc<FileMetadata>,
        file_path: impl Into<PathBuf>,
        retry: RetryPolicy,
        shutdown_token: CancellationToken,
    ) -> Self {
        let file_path = file_path.into();
        let workers = neighbors
            .iter()
            .map(|neighbor| {
                DownloadWorker::new(
                    neighbor.clone(),
                    tracker.clone(),
                    metadata.clone(),
                    file_path.clone(),
                    retry,
                    shutdown_token.child_token(),
                )
            })
            .collect();

        Self { workers }
    }

    pub fn neighbor_count(&self) -> usize {
        self.workers.len()
    }

    /// runs every worker to completion. returns once all of them have stopped, whatever the
    /// reason.
    pub async fn run(self) -> Vec<WorkerReport> {
        let mut join_set = JoinSet::new();
        for worker in self.workers {
            debug!(neighbor = %worker.neighbor(), "spawning download worker");
            join_set.spawn(worker.run());
        }

        let mut reports = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!("download worker panicked: {err}"),
            }
        }
        reports
    }
}
