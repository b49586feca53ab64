use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::block_picker::BlockTracker;
use crate::config::{Neighbor, RetryPolicy};
use crate::metainfo::{BlockId, FileMetadata};
use crate::peer_protocol::{upgrade_stream, PeerFrames, PeerMessage, PeerStream};
use crate::prelude::*;
use crate::storage;

pub use self::errors::{ConnectError, FetchError};

/// why a worker stopped pulling from its neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// every block is held locally
    Complete,
    /// the shutdown token was cancelled
    Stopped,
    /// connecting (or reconnecting) ran out of attempts
    Unreachable,
    /// the neighbor is sharing a file with a different block count
    WrongFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub neighbor: Neighbor,
    pub blocks_fetched: usize,
    pub exit: WorkerExit,
}

/// Pulls missing blocks from a single neighbor, one request at a time.
///
/// Workers for different neighbors know nothing about each other. They all ask the shared
/// [`BlockTracker`] for the lowest missing block, so two of them can end up fetching the same
/// block at once. Both copies are verified and written to the same byte range, the second write
/// and the second mark are harmless.
pub struct DownloadWorker {
    neighbor: Neighbor,
    tracker: Arc<BlockTracker>,
    metadata: Arc<FileMetadata>,
    file_path: PathBuf,
    retry: RetryPolicy,
    shutdown_token: CancellationToken,
}

pub async fn connect_with_retry(
    neighbor: &Neighbor,
    retry: &RetryPolicy,
) -> Result<PeerFrames<TcpStream>, ConnectError> {
    let attempts = retry.connect_attempts.max(1);
    let mut attempt = 1;

    loop {
        let connect = TcpStream::connect(neighbor.socket_addr());
        let err = match timeout(retry.connect_timeout, connect).await {
            Ok(Ok(stream)) => return Ok(upgrade_stream(stream)),
            Ok(Err(err)) => err,
            Err(_) => std::io::ErrorKind::TimedOut.into(),
        };

        if attempt == attempts {
            return Err(ConnectError {
                attempts,
                source: err,
            });
        }

        warn!(
            "failed to connect to {neighbor} (attempt {attempt}/{attempts}): {err}, retrying in {:?}",
            retry.retry_delay
        );
        sleep(retry.retry_delay).await;
        attempt += 1;
    }
}

impl DownloadWorker {
    pub fn new(
        neighbor: Neighbor,
        tracker: Arc<BlockTracker>,
        metadata: Arc<FileMetadata>,
        file_path: impl Into<PathBuf>,
        retry: RetryPolicy,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            neighbor,
            tracker,
            metadata,
            file_path: file_path.into(),
            retry,
            shutdown_token,
        }
    }

    pub fn neighbor(&self) -> &Neighbor {
        &self.neighbor
    }

    #[instrument(level = "info", name = "download worker", skip_all, fields(neighbor = %self.neighbor))]
    pub async fn run(self) -> WorkerReport {
        let mut blocks_fetched = 0;
        let exit = self.download(&mut blocks_fetched).await;

        info!(?exit, blocks_fetched, "download worker finished");
        WorkerReport {
            neighbor: self.neighbor,
            blocks_fetched,
            exit,
        }
    }

    async fn download(&self, blocks_fetched: &mut usize) -> WorkerExit {
        info!("connecting to neighbor");
        let mut stream = match connect_with_retry(&self.neighbor, &self.retry).await {
            Ok(stream) => stream,
            Err(err) => {
                error!("giving up on neighbor: {err}");
                return WorkerExit::Unreachable;
            }
        };
        info!("connected");

        if let Some(exit) = self.introduce(&mut stream).await {
            return exit;
        }

        loop {
            if self.shutdown_token.is_cancelled() {
                info!("shutdown signal received, stopping worker");
                return WorkerExit::Stopped;
            }

            if self.tracker.is_complete() {
                return WorkerExit::Complete;
            }

            let Some(block_id) = self.tracker.next_missing_block() else {
                return WorkerExit::Complete;
            };

            match self.fetch_block(&mut stream, block_id).await {
                Ok(()) => {
                    *blocks_fetched += 1;
                    info!(
                        block_id,
                        "block downloaded, progress {:.1}%",
                        self.tracker.progress() * 100.0
                    );
                }

                Err(err) => {
                    warn!(block_id, "block download failed: {err}");

                    if err.is_transport() {
                        info!("reconnecting to neighbor");
                        stream = match connect_with_retry(&self.neighbor, &self.retry).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                error!("reconnect failed, giving up on neighbor: {err}");
                                return WorkerExit::Unreachable;
                            }
                        };
                    }

                    sleep(self.retry.request_backoff).await;
                }
            }
        }
    }

    /// asks the neighbor what it holds. returns an exit if the neighbor should be dropped.
    async fn introduce<T: PeerStream>(&self, stream: &mut T) -> Option<WorkerExit> {
        match request(stream, PeerMessage::RequestInfo).await {
            Ok(PeerMessage::PeerInfo {
                available_blocks,
                total_blocks,
            }) => {
                if total_blocks != self.tracker.total_blocks() {
                    error!(
                        "neighbor shares a file of {total_blocks} blocks, expected {}",
                        self.tracker.total_blocks()
                    );
                    return Some(WorkerExit::WrongFile);
                }
                info!(
                    "neighbor holds {}/{total_blocks} blocks",
                    available_blocks.len()
                );
            }
            Ok(other) => warn!(kind = other.kind(), "unexpected reply to info request"),
            // a broken connection surfaces again on the first block request, which reconnects
            Err(err) => warn!("info request failed: {err}"),
        }
        None
    }

    /// requests one block and, if it verifies, writes it to its place in the file and marks it
    /// held. a block that fails verification is neither written nor marked.
    #[instrument(level = "debug", name = "fetch block", skip(self, stream))]
    pub async fn fetch_block<T: PeerStream>(
        &self,
        stream: &mut T,
        block_id: BlockId,
    ) -> Result<(), FetchError> {
        let descriptor = self.metadata.block(block_id)?;

        match request(stream, PeerMessage::RequestBlock { block_id }).await? {
            PeerMessage::BlockData {
                block_id: received_id,
                data,
                checksum,
            } => {
                if received_id != block_id {
                    return Err(FetchError::Unexpected(format!(
                        "asked for block {block_id}, received block {received_id}"
                    )));
                }

                if !checksum.matches(&data) {
                    return Err(FetchError::ChecksumMismatch {
                        block_id,
                        reason: "data does not match the digest sent with it",
                    });
                }

                if checksum != descriptor.hash {
                    return Err(FetchError::ChecksumMismatch {
                        block_id,
                        reason: "digest does not match the metadata",
                    });
                }

                trace!(bytes = data.len(), "writing block to file");
                storage::write_at_offset(&self.file_path, descriptor.offset, &data)
                    .await
                    .map_err(FetchError::Storage)?;

                self.tracker.mark_available(block_id);
                Ok(())
            }

            PeerMessage::Error { message } => Err(FetchError::Remote(message)),

            other => Err(FetchError::Unexpected(other.kind().to_owned())),
        }
    }
}

/// one request, one response.
async fn request<T: PeerStream>(
    stream: &mut T,
    message: PeerMessage,
) -> Result<PeerMessage, FetchError> {
    stream.send(message).await?;

    match stream.next().await {
        Some(frame) => Ok(frame??),
        None => Err(FetchError::ConnectionClosed),
    }
}

mod errors {
    use thiserror::Error;

    use crate::metainfo::{BlockId, MetadataError};
    use crate::peer_protocol::{DecodeError, ProtocolError};

    #[derive(Error, Debug)]
    #[error("failed to connect after {attempts} attempts: {source}")]
    pub struct ConnectError {
        pub attempts: u32,
        pub source: std::io::Error,
    }

    /// why a single block request failed. only transport failures call for a new connection,
    /// everything else is retried on the same one.
    #[derive(Error, Debug)]
    pub enum FetchError {
        #[error(transparent)]
        Transport(#[from] ProtocolError),

        #[error("neighbor closed the connection")]
        ConnectionClosed,

        #[error(transparent)]
        Decode(#[from] DecodeError),

        #[error("neighbor answered with an error: {0}")]
        Remote(String),

        #[error("unexpected response: {0}")]
        Unexpected(String),

        #[error("checksum mismatch for block {block_id}: {reason}")]
        ChecksumMismatch {
            block_id: BlockId,
            reason: &'static str,
        },

        #[error(transparent)]
        Metadata(#[from] MetadataError),

        #[error("failed to store block: {0}")]
        Storage(#[source] std::io::Error),
    }

    impl FetchError {
        pub fn is_transport(&self) -> bool {
            matches!(self, Self::Transport(_) | Self::ConnectionClosed)
        }
    }
}
