//! A peer node: one tracker, one server and, for a leecher with neighbors, one client.
//!
//! A node is built from a [`NodeConfig`] with [`PeerNode::new`], starts listening with
//! [`PeerNode::start`] and is told to wind down with [`PeerNode::stop`]. A leecher that manages
//! to download and validate the whole file switches to [`NodeMode::Seeder`]. The switch happens
//! at most once and is never undone.

mod completion;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::block_picker::BlockTracker;
use crate::config::{Neighbor, NodeConfig, NodeMode};
use crate::metainfo::FileMetadata;
use crate::peers::client::ExchangeClient;
use crate::peers::server::{ExchangeServer, ServerHandle};
use crate::peers::PeerAddr;
use crate::prelude::*;
use crate::storage;

pub use completion::{validate_download, DownloadReport, ValidationError};

use completion::CompletionWatcher;

/// point in time view of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub peer_id: String,
    pub mode: NodeMode,
    pub port: u16,
    pub total_blocks: usize,
    pub available_blocks: usize,
    pub missing_blocks: usize,
    pub progress: f64,
    pub complete: bool,
}

pub struct PeerNode {
    peer_id: String,
    listen_port: u16,
    file_path: PathBuf,
    metadata: Arc<FileMetadata>,
    tracker: Arc<BlockTracker>,
    neighbors: Vec<Neighbor>,
    mode: Arc<watch::Sender<NodeMode>>,
    client: Option<ExchangeClient>,
    server: Option<ServerHandle>,
    watcher: Option<JoinHandle<Option<DownloadReport>>>,
    report: Option<DownloadReport>,
    shutdown_token: CancellationToken,
    started_at: Instant,
}

impl PeerNode {
    /// loads the metadata and prepares the local file.
    ///
    /// a seeder needs the complete file at `file_path`. a leecher gets a zero filled file of the
    /// final size in `download_dir`, so that every block can be written in place.
    #[instrument(level = "info", name = "node setup", skip_all, fields(peer_id = %config.peer_id, mode = %config.mode))]
    pub async fn new(config: NodeConfig) -> anyhow::Result<Self> {
        let metadata = FileMetadata::load(&config.metadata_path)
            .await
            .with_context(|| {
                format!("failed to load metadata from {}", config.metadata_path.display())
            })?;
        info!(
            file = %metadata.file_name,
            size = metadata.file_size,
            blocks = metadata.total_blocks,
            "loaded metadata"
        );

        let metadata = Arc::new(metadata);
        let tracker = Arc::new(BlockTracker::new(metadata.total_blocks));
        let shutdown_token = CancellationToken::new();

        let (file_path, client) = match config.mode {
            NodeMode::Seeder => {
                let Some(file_path) = config.file_path else {
                    bail!("a seeder needs the path of the file it shares");
                };
                let source = tokio::fs::metadata(&file_path)
                    .await
                    .with_context(|| format!("source file {} not found", file_path.display()))?;
                if !source.is_file() {
                    bail!("source path {} is not a file", file_path.display());
                }
                if source.len() != metadata.file_size {
                    warn!(
                        "source file is {} bytes but the metadata says {}",
                        source.len(),
                        metadata.file_size
                    );
                }

                tracker.mark_all_available();
                (file_path, None)
            }

            NodeMode::Leecher => {
                tokio::fs::create_dir_all(&config.download_dir)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to create download directory {}",
                            config.download_dir.display()
                        )
                    })?;

                let file_path = config.download_dir.join(&metadata.file_name);
                storage::preallocate(&file_path, metadata.file_size)
                    .await
                    .with_context(|| format!("failed to allocate {}", file_path.display()))?;
                debug!(path = %file_path.display(), "allocated download file");

                let client = if config.neighbors.is_empty() {
                    warn!("no neighbors configured, nothing will be downloaded");
                    None
                } else {
                    Some(ExchangeClient::new(
                        &config.neighbors,
                        tracker.clone(),
                        metadata.clone(),
                        &file_path,
                        config.retry,
                        shutdown_token.child_token(),
                    ))
                };
                (file_path, client)
            }
        };

        // the watcher flips the mode with send_replace, which needs no live receiver
        let (mode, _) = watch::channel(config.mode);

        Ok(Self {
            peer_id: config.peer_id,
            listen_port: config.listen_port,
            file_path,
            metadata,
            tracker,
            neighbors: config.neighbors,
            mode: Arc::new(mode),
            client,
            server: None,
            watcher: None,
            report: None,
            shutdown_token,
            started_at: Instant::now(),
        })
    }

    /// starts listening and, for a leecher with neighbors, downloading.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.server.is_some() {
            bail!("node {} is already started", self.peer_id);
        }

        let server = ExchangeServer::new(
            self.tracker.clone(),
            self.metadata.clone(),
            self.file_path.clone(),
        );
        let handle = server
            .bind(
                (Ipv4Addr::UNSPECIFIED, self.listen_port),
                self.shutdown_token.child_token(),
            )
            .await
            .with_context(|| format!("failed to listen on port {}", self.listen_port))?;
        self.server = Some(handle);
        self.started_at = Instant::now();

        info!(
            peer_id = %self.peer_id,
            mode = %self.mode(),
            neighbors = self.neighbors.len(),
            "node started"
        );

        if let Some(client) = self.client.take() {
            let watcher = CompletionWatcher {
                client,
                tracker: self.tracker.clone(),
                metadata: self.metadata.clone(),
                file_path: self.file_path.clone(),
                mode: self.mode.clone(),
                started_at: self.started_at,
            };
            self.watcher = Some(tokio::spawn(watcher.run()));
        }

        Ok(())
    }

    /// tells the download workers to stop and closes the listening socket. open connections are
    /// left to finish on their own. dropping the node does the same.
    pub fn stop(&self) {
        info!(peer_id = %self.peer_id, "stopping node");
        self.shutdown_token.cancel();
    }

    /// waits until the download has finished and been validated. returns at once for a node
    /// that isn't downloading.
    pub async fn wait(&mut self) {
        let Some(watcher) = self.watcher.take() else {
            return;
        };

        match watcher.await {
            Ok(report) => self.report = report,
            Err(err) => error!("completion watcher failed: {err}"),
        }
    }

    pub fn progress(&self) -> f64 {
        self.tracker.progress()
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.is_complete()
    }

    pub fn mode(&self) -> NodeMode {
        *self.mode.borrow()
    }

    /// yields every mode change from now on.
    pub fn subscribe_mode(&self) -> watch::Receiver<NodeMode> {
        self.mode.subscribe()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// the bound listening address, once started.
    pub fn local_addr(&self) -> Option<PeerAddr> {
        self.server.as_ref().map(ServerHandle::local_addr)
    }

    /// the shared file, the source for a seeder and the download target for a leecher.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// set once [`PeerNode::wait`] has seen a successful download.
    pub fn report(&self) -> Option<&DownloadReport> {
        self.report.as_ref()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peer_id: self.peer_id.clone(),
            mode: self.mode(),
            port: self.local_addr().map_or(self.listen_port, |addr| addr.port()),
            total_blocks: self.tracker.total_blocks(),
            available_blocks: self.tracker.available_count(),
            missing_blocks: self.tracker.missing_count(),
            progress: self.tracker.progress(),
            complete: self.tracker.is_complete(),
        }
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT_LIMIT: Duration = Duration::from_secs(10);

    struct Swarm {
        temp: TempDir,
        source: PathBuf,
        metadata_path: PathBuf,
        contents: Vec<u8>,
    }

    /// a 9216 byte file cut into blocks of 4096, 4096 and 1024 bytes.
    async fn swarm() -> Swarm {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("shared.bin");
        let contents: Vec<u8> = (0..9216u32).map(|i| (i * 7 % 256) as u8).collect();
        tokio::fs::write(&source, &contents).await.unwrap();

        let metadata = FileMetadata::generate(&source, 4096).await.unwrap();
        let metadata_path = temp.path().join("shared.meta.json");
        metadata.save(&metadata_path).await.unwrap();

        Swarm {
            temp,
            source,
            metadata_path,
            contents,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            connect_attempts: 2,
            retry_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(500),
            request_backoff: Duration::from_millis(10),
        }
    }

    impl Swarm {
        fn seeder_config(&self) -> NodeConfig {
            NodeConfig {
                peer_id: "seeder".into(),
                listen_port: 0,
                mode: NodeMode::Seeder,
                file_path: Some(self.source.clone()),
                metadata_path: self.metadata_path.clone(),
                download_dir: self.temp.path().join("unused"),
                neighbors: Vec::new(),
                retry: fast_retry(),
            }
        }

        fn leecher_config(&self, name: &str, neighbors: Vec<Neighbor>) -> NodeConfig {
            NodeConfig {
                peer_id: name.into(),
                listen_port: 0,
                mode: NodeMode::Leecher,
                file_path: None,
                metadata_path: self.metadata_path.clone(),
                download_dir: self.temp.path().join(name),
                neighbors,
                retry: fast_retry(),
            }
        }

        async fn started(&self, config: NodeConfig) -> PeerNode {
            let mut node = PeerNode::new(config).await.unwrap();
            node.start().await.unwrap();
            node
        }
    }

    fn neighbor_of(node: &PeerNode) -> Neighbor {
        Neighbor::new("127.0.0.1", node.local_addr().unwrap().port())
    }

    #[tokio::test]
    async fn seeder_holds_everything_from_the_start() {
        let swarm = swarm().await;
        let seeder = swarm.started(swarm.seeder_config()).await;

        assert_eq!(seeder.mode(), NodeMode::Seeder);
        assert!(seeder.is_complete());
        assert_eq!(seeder.progress(), 1.0);
        assert_eq!(seeder.file_path(), swarm.source);

        let stats = seeder.stats();
        assert_eq!(stats.total_blocks, 3);
        assert_eq!(stats.available_blocks, 3);
        assert_eq!(stats.missing_blocks, 0);
        assert_ne!(stats.port, 0);

        seeder.stop();
    }

    #[tokio::test]
    async fn leecher_downloads_validates_and_becomes_seeder() {
        let swarm = swarm().await;
        let seeder = swarm.started(swarm.seeder_config()).await;

        let mut leecher = swarm
            .started(swarm.leecher_config("leecher", vec![neighbor_of(&seeder)]))
            .await;
        let mut mode_changes = leecher.subscribe_mode();
        assert_eq!(leecher.mode(), NodeMode::Leecher);

        timeout(WAIT_LIMIT, leecher.wait()).await.unwrap();

        assert!(leecher.is_complete());
        assert_eq!(leecher.progress(), 1.0);
        assert_eq!(leecher.mode(), NodeMode::Seeder);
        assert!(mode_changes.has_changed().unwrap());
        assert_eq!(*mode_changes.borrow_and_update(), NodeMode::Seeder);
        assert_eq!(
            leecher.file_path(),
            swarm.temp.path().join("leecher").join("shared.bin")
        );
        assert_eq!(
            tokio::fs::read(leecher.file_path()).await.unwrap(),
            swarm.contents
        );

        let report = leecher.report().unwrap();
        assert_eq!(report.file_size, 9216);
        assert_eq!(report.total_blocks, 3);
        assert_eq!(report.file_hash, leecher.metadata().file_hash);

        leecher.stop();
        seeder.stop();
    }

    #[tokio::test]
    async fn finished_leecher_serves_the_next_one() {
        let swarm = swarm().await;
        let seeder = swarm.started(swarm.seeder_config()).await;
        let mut first = swarm
            .started(swarm.leecher_config("first", vec![neighbor_of(&seeder)]))
            .await;
        timeout(WAIT_LIMIT, first.wait()).await.unwrap();
        seeder.stop();

        let mut second = swarm
            .started(swarm.leecher_config("second", vec![neighbor_of(&first)]))
            .await;
        timeout(WAIT_LIMIT, second.wait()).await.unwrap();

        assert_eq!(second.mode(), NodeMode::Seeder);
        assert_eq!(
            tokio::fs::read(second.file_path()).await.unwrap(),
            swarm.contents
        );
    }

    #[tokio::test]
    async fn neighbors_racing_for_the_same_blocks_still_complete() {
        let swarm = swarm().await;
        let seeder = swarm.started(swarm.seeder_config()).await;
        let neighbor = neighbor_of(&seeder);

        let mut leecher = swarm
            .started(swarm.leecher_config(
                "leecher",
                vec![neighbor.clone(), neighbor.clone(), neighbor],
            ))
            .await;
        timeout(WAIT_LIMIT, leecher.wait()).await.unwrap();

        let stats = leecher.stats();
        assert_eq!(stats.available_blocks, stats.total_blocks);
        assert_eq!(stats.mode, NodeMode::Seeder);
        assert_eq!(
            tokio::fs::read(leecher.file_path()).await.unwrap(),
            swarm.contents
        );
    }

    #[tokio::test]
    async fn leecher_without_neighbors_only_serves() {
        let swarm = swarm().await;
        let mut leecher = swarm.started(swarm.leecher_config("lonely", Vec::new())).await;

        timeout(WAIT_LIMIT, leecher.wait()).await.unwrap();

        assert_eq!(leecher.mode(), NodeMode::Leecher);
        assert_eq!(leecher.progress(), 0.0);
        assert!(leecher.report().is_none());
        // zero filled up front
        assert_eq!(
            tokio::fs::read(leecher.file_path()).await.unwrap(),
            vec![0; 9216]
        );
    }

    #[tokio::test]
    async fn unreachable_neighbor_leaves_node_a_leecher() {
        let swarm = swarm().await;
        let closed_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut leecher = swarm
            .started(swarm.leecher_config(
                "stranded",
                vec![Neighbor::new("127.0.0.1", closed_port)],
            ))
            .await;
        timeout(WAIT_LIMIT, leecher.wait()).await.unwrap();

        assert_eq!(leecher.mode(), NodeMode::Leecher);
        assert!(!leecher.is_complete());
        assert!(leecher.report().is_none());
    }

    #[tokio::test]
    async fn seeder_requires_its_source_file() {
        let swarm = swarm().await;
        let config = NodeConfig {
            file_path: Some(swarm.temp.path().join("missing.bin")),
            ..swarm.seeder_config()
        };

        assert!(PeerNode::new(config).await.is_err());
    }

    #[tokio::test]
    async fn unreadable_metadata_is_fatal() {
        let swarm = swarm().await;
        let config = NodeConfig {
            metadata_path: swarm.temp.path().join("missing.meta.json"),
            ..swarm.leecher_config("leecher", Vec::new())
        };

        assert!(PeerNode::new(config).await.is_err());
    }

    #[tokio::test]
    async fn starting_twice_fails() {
        let swarm = swarm().await;
        let mut seeder = swarm.started(swarm.seeder_config()).await;

        assert!(seeder.start().await.is_err());
        seeder.stop();
    }

    #[tokio::test]
    async fn stopped_leecher_fetches_nothing_from_a_reachable_seeder() {
        let swarm = swarm().await;
        let seeder = swarm.started(swarm.seeder_config()).await;

        let config = swarm.leecher_config("leecher", vec![neighbor_of(&seeder)]);
        let mut leecher = PeerNode::new(config).await.unwrap();
        leecher.stop();
        leecher.start().await.unwrap();
        timeout(WAIT_LIMIT, leecher.wait()).await.unwrap();

        assert_eq!(leecher.stats().available_blocks, 0);
        assert!(!leecher.is_complete());
        assert_eq!(leecher.mode(), NodeMode::Leecher);
        assert!(leecher.report().is_none());

        seeder.stop();
    }

    #[tokio::test]
    async fn dropping_a_node_closes_its_listener() {
        let swarm = swarm().await;
        let seeder = swarm.started(swarm.seeder_config()).await;
        let port = seeder.local_addr().unwrap().port();

        drop(seeder);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err());
    }
}
