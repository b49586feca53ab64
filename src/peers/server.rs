use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::block_picker::BlockTracker;
use crate::metainfo::{BlockId, Digest, FileMetadata};
use crate::peer_protocol::{upgrade_stream, PeerMessage, PeerStream};
use crate::prelude::*;
use crate::storage;

use super::PeerAddr;

/// pause after a failed accept, errors like EMFILE persist until a connection closes
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Answers block and availability requests from other peers out of the local file.
///
/// Every accepted connection gets its own task and is served until the remote side hangs up or
/// the transport fails. Requests on one connection are answered strictly in order.
#[derive(Debug)]
pub struct ExchangeServer {
    tracker: Arc<BlockTracker>,
    metadata: Arc<FileMetadata>,
    file_path: PathBuf,
}

/// handle to a listening server. dropping it does not stop the server, [`ServerHandle::shutdown`]
/// does.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: PeerAddr,
    shutdown_token: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> PeerAddr {
        self.local_addr
    }

    /// closes the listening socket. connections that are already open are left to finish.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// waits for the accept loop and every connection it spawned to finish.
    pub async fn join(self) {
        if let Err(err) = self.accept_task.await {
            error!("accept loop failed: {err}");
        }
    }
}

impl ExchangeServer {
    pub fn new(
        tracker: Arc<BlockTracker>,
        metadata: Arc<FileMetadata>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tracker,
            metadata,
            file_path: file_path.into(),
        }
    }

    pub async fn bind(
        self,
        addr: impl ToSocketAddrs,
        shutdown_token: CancellationToken,
    ) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for peers");

        let incoming = TcpListenerStream::new(listener);
        let accept_loop = Arc::new(self).accept_loop(incoming, shutdown_token.clone());
        let accept_task = tokio::spawn(accept_loop);

        Ok(ServerHandle {
            local_addr,
            shutdown_token,
            accept_task,
        })
    }

    #[instrument(level = "debug", name = "accept loop", skip_all)]
    async fn accept_loop<S>(self: Arc<Self>, mut incoming: S, shutdown_token: CancellationToken)
    where
        S: Stream<Item = io::Result<TcpStream>> + Unpin + Send + 'static,
    {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("shutdown signal received, no longer accepting connections");
                    break;
                }

                accepted = incoming.next() => match accepted {
                    Some(Ok(stream)) => {
                        let remote = match stream.peer_addr() {
                            Ok(remote) => remote,
                            Err(err) => {
                                warn!("dropping connection without a peer address: {err}");
                                continue;
                            }
                        };
                        let server = Arc::clone(&self);
                        connections.spawn(async move {
                            server.serve(upgrade_stream(stream), remote).await
                        });
                    }
                    Some(Err(err)) => {
                        warn!("failed to accept connection: {err}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                    None => break,
                },

                // reap finished handlers so the set stays small on long running nodes
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // closes the listening socket
        drop(incoming);

        if !connections.is_empty() {
            debug!(open = connections.len(), "waiting for open connections to drain");
        }
        while connections.join_next().await.is_some() {}
    }

    #[instrument(level = "info", name = "peer connection", skip_all, fields(%remote))]
    pub async fn serve<T: PeerStream>(&self, mut stream: T, remote: PeerAddr) {
        info!("new connection");

        loop {
            let decoded = match stream.next().await {
                Some(Ok(decoded)) => decoded,
                Some(Err(err)) => {
                    warn!("transport error, closing connection: {err}");
                    return;
                }
                None => {
                    info!("connection closed by peer");
                    return;
                }
            };

            let response = match decoded {
                Ok(request) => self.respond(request).await,
                Err(err) => {
                    warn!("{err}");
                    PeerMessage::error(format!("failed to parse message: {err}"))
                }
            };

            if let Err(err) = stream.send(response).await {
                warn!("failed to send response, closing connection: {err}");
                return;
            }
        }
    }

    async fn respond(&self, request: PeerMessage) -> PeerMessage {
        type PM = PeerMessage;
        match request {
            PM::RequestInfo => self.peer_info(),
            PM::RequestBlock { block_id } => self.block_data(block_id).await,

            other @ (PM::BlockData { .. } | PM::PeerInfo { .. } | PM::Error { .. }) => {
                warn!(kind = other.kind(), "received a response-only message as a request");
                PeerMessage::error(format!("unsupported message type {}", other.kind()))
            }
        }
    }

    fn peer_info(&self) -> PeerMessage {
        let available_blocks = self.tracker.available_ids();
        let total_blocks = self.tracker.total_blocks();
        debug!(
            "info requested, holding {}/{} blocks",
            available_blocks.len(),
            total_blocks
        );

        PeerMessage::PeerInfo {
            available_blocks,
            total_blocks,
        }
    }

    #[instrument(level = "debug", name = "serve block", skip(self))]
    async fn block_data(&self, block_id: BlockId) -> PeerMessage {
        if !self.tracker.is_available(block_id) {
            debug!("requested block is not available");
            return PeerMessage::error(format!("block {block_id} not available"));
        }

        let descriptor = match self.metadata.block(block_id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!("{err}");
                return PeerMessage::error("failed to look up block metadata");
            }
        };

        let data = match storage::read_exact_range(
            &self.file_path,
            descriptor.offset,
            descriptor.len(),
        )
        .await
        {
            Ok(data) => data,
            Err(err) => {
                error!("failed to read block from disk: {err}");
                return PeerMessage::error(format!("failed to read block {block_id}: {err}"));
            }
        };

        let checksum = Digest::of(&data);
        if checksum != descriptor.hash {
            // the receiving side verifies against its own metadata and will discard it
            warn!(expected = %descriptor.hash, actual = %checksum, "block on disk does not match metadata, serving it anyway");
        }

        debug!(bytes = data.len(), "sending block");
        PeerMessage::BlockData {
            block_id,
            data,
            checksum,
        }
    }
}
