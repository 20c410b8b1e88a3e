//! Test harness for in-process sprinkler-node integration tests.
//!
//! Provides TestNode (single node), TestNodeBuilder (config), and TestMesh
//! (N-node orchestrator) running real tokio tasks over a shared
//! MemoryNetwork.

use std::sync::Arc;
use std::time::Duration;

use sprinkler_dissemination::{Coder, CompletedTransfer, SessionEvent, SessionState, SessionStatus};
use sprinkler_fountain::RaptorQCoder;
use sprinkler_node::config::{ChannelSection, NodeConfig};
use sprinkler_node::transport::MemoryNetwork;
use sprinkler_node::{spawn_node, NodeHandle};
use sprinkler_protocol::Version;
use tokio::sync::{broadcast, Mutex};

pub const BLOCK_SIZE: u16 = 256;

/// Read TEST_NODE_COUNT from environment, falling back to `default`.
pub fn test_node_count(default: usize) -> usize {
    std::env::var("TEST_NODE_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Scale a base timeout by node count.
/// Formula: base_secs * ceil(n / 4), minimum = base_secs.
pub fn scaled_timeout(n: usize, base_secs: u64) -> Duration {
    let factor = ((n as f64) / 4.0).ceil().max(1.0) as u64;
    Duration::from_secs(base_secs * factor)
}

/// Multi-thread runtime with a worker count from TEST_WORKER_THREADS.
pub fn build_test_runtime(default_workers: usize) -> tokio::runtime::Runtime {
    let workers = std::env::var("TEST_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default_workers);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .expect("test runtime")
}

/// Deterministic file content for a test.
pub fn test_file(len: usize, seed: u64) -> Vec<u8> {
    sprinkler_dissemination::testing::sample_content(len, seed)
}

/// Timing scaled down so a transfer finishes in a few seconds.
pub fn fast_config(name: &str) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.name = name.into();
    cfg.dissemination.block_size = BLOCK_SIZE;
    cfg.dissemination.symbols_per_burst = 8;
    cfg.dissemination.decode_every = 4;
    cfg.dissemination.retention_secs = 2;
    cfg.dissemination.relay_after_complete = false;
    cfg.dissemination.control = ChannelSection {
        interval_min_ms: 50,
        interval_max_ms: 1_600,
        redundancy: 2,
    };
    cfg.dissemination.data = ChannelSection {
        interval_min_ms: 10,
        interval_max_ms: 320,
        redundancy: 2,
    };
    cfg
}

/// A running in-process node.
pub struct TestNode {
    pub handle: NodeHandle,
    pub transport_id: usize,
    events: Mutex<broadcast::Receiver<SessionEvent>>,
    history: Mutex<Vec<SessionEvent>>,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }

    pub async fn publish(&self, version: Version, data: &[u8]) -> anyhow::Result<()> {
        self.handle.publish_bytes(version, data).await
    }

    pub async fn status(&self) -> anyhow::Result<SessionStatus> {
        self.handle.status().await
    }

    /// Wait for the Completed event of `version`.
    pub async fn wait_transfer(
        &self,
        version: Version,
        timeout: Duration,
    ) -> anyhow::Result<CompletedTransfer> {
        let mut events = self.events.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .map_err(|_| {
                    anyhow::anyhow!("{}: timeout waiting for version {version}", self.handle.name())
                })?;
            match event {
                Ok(event) => {
                    self.history.lock().await.push(event.clone());
                    if let SessionEvent::Completed(t) = event {
                        if t.version == version {
                            return Ok(t);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("{}: event channel closed", self.handle.name())
                }
            }
        }
    }

    /// Every event since the node started, without blocking.
    pub async fn seen_events(&self) -> Vec<SessionEvent> {
        let mut events = self.events.lock().await;
        let mut history = self.history.lock().await;
        loop {
            match events.try_recv() {
                Ok(e) => history.push(e),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return history.clone(),
            }
        }
    }

    /// Poll status until the session reaches `state` at `version`.
    pub async fn wait_state(
        &self,
        version: Version,
        state: SessionState,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if let Some(session) = &status.session {
                if session.version == version && session.state == state {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for v{version} {state}. status: {}",
                    self.handle.name(),
                    serde_json::to_string(&status)?
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

pub struct TestNodeBuilder {
    config: NodeConfig,
    coder: Arc<dyn Coder>,
    seed: u64,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: fast_config(name),
            coder: Arc::new(RaptorQCoder::new()),
            seed: name.bytes().fold(7u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64)),
        }
    }

    pub fn relay(mut self, relay: bool) -> Self {
        self.config.dissemination.relay_after_complete = relay;
        self
    }

    pub fn await_interest(mut self, await_interest: bool) -> Self {
        self.config.dissemination.await_interest = await_interest;
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut NodeConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn coder(mut self, coder: Arc<dyn Coder>) -> Self {
        self.coder = coder;
        self
    }

    pub fn build(self, network: &MemoryNetwork) -> anyhow::Result<TestNode> {
        let transport = network.join(self.config.network.max_datagram_bytes);
        let transport_id = transport.id();
        let handle = spawn_node(&self.config, transport, self.coder, self.seed)?;
        let events = Mutex::new(handle.subscribe());
        Ok(TestNode {
            handle,
            transport_id,
            events,
            history: Mutex::new(Vec::new()),
        })
    }
}

/// N nodes on one MemoryNetwork. Node 0 is conventionally the seeder.
pub struct TestMesh {
    pub network: MemoryNetwork,
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestMesh {
    pub fn new(n: usize) -> anyhow::Result<Self> {
        Self::with_builder(n, |_, b| b)
    }

    pub fn with_builder(
        n: usize,
        mut customise: impl FnMut(usize, TestNodeBuilder) -> TestNodeBuilder,
    ) -> anyhow::Result<Self> {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let builder = customise(i, TestNodeBuilder::new(&format!("node-{i}")));
            nodes.push(builder.build(&network)?);
        }
        Ok(Self { network, nodes })
    }

    /// Every node except the seeder completes `version` with `data`.
    pub async fn wait_all_received(
        &self,
        version: Version,
        data: &[u8],
        timeout: Duration,
    ) -> anyhow::Result<()> {
        for node in self.nodes.iter().skip(1) {
            let transfer = node.wait_transfer(version, timeout).await?;
            anyhow::ensure!(
                transfer.file_bytes().as_ref() == data,
                "{}: content mismatch",
                node.handle.name()
            );
        }
        Ok(())
    }

    pub async fn shutdown_all(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
