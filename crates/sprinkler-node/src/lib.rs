//! Sprinkler Node -- library crate for multicast file dissemination.
//!
//! Wires a `DisseminationEngine` to a `Transport` with two tokio tasks
//! (listener + decision loop) and hands back a `NodeHandle`. Integration
//! tests and main.rs both go through `spawn_node`.

pub mod config;
pub mod dissemination_task;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use sprinkler_dissemination::{Coder, DisseminationEngine, SessionEvent, SessionStatus, SourceBlocks};
use sprinkler_protocol::Version;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::dissemination_task::SessionCommand;
use crate::transport::Transport;

/// Control side of a running node.
pub struct NodeHandle {
    name: String,
    block_size: u16,
    cmd_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seed `content` as `version`.
    pub async fn publish(&self, version: Version, content: SourceBlocks) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Publish {
                version,
                content,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("dissemination loop has exited"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("publish reply dropped"))??;
        Ok(())
    }

    /// Split `data` with the configured block size and seed it.
    pub async fn publish_bytes(&self, version: Version, data: &[u8]) -> anyhow::Result<()> {
        let content = SourceBlocks::from_bytes(data, self.block_size)?;
        self.publish(version, content).await
    }

    pub async fn status(&self) -> anyhow::Result<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Status { reply })
            .await
            .map_err(|_| anyhow::anyhow!("dissemination loop has exited"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("status reply dropped"))
    }

    /// Stop the current session. The node stays up and silent.
    pub async fn stop_session(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Stop { reply })
            .await
            .map_err(|_| anyhow::anyhow!("dissemination loop has exited"))?;
        rx.await.map_err(|_| anyhow::anyhow!("stop reply dropped"))
    }

    /// Resume beaconing after `stop_session`.
    pub async fn start(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Start { reply })
            .await
            .map_err(|_| anyhow::anyhow!("dissemination loop has exited"))?;
        rx.await.map_err(|_| anyhow::anyhow!("start reply dropped"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Signal both tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Build the engine and spawn the listener and decision loop tasks.
pub fn spawn_node<T: Transport>(
    config: &NodeConfig,
    transport: T,
    coder: Arc<dyn Coder>,
    seed: u64,
) -> anyhow::Result<NodeHandle> {
    config.validate()?;
    let engine = DisseminationEngine::new(config.to_engine_config(), coder.clone(), seed)?;
    let transport = Arc::new(transport);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (event_tx, _) = broadcast::channel::<SessionEvent>(64);
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.node.inbound_queue);

    let listener = {
        let transport = transport.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            dissemination_task::run_listener(transport, inbound_tx, shutdown).await;
        })
    };

    let decision = {
        let event_tx = event_tx.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            dissemination_task::run_dissemination_loop(
                engine, coder, transport, inbound_rx, cmd_rx, event_tx, shutdown,
            )
            .await;
        })
    };

    tracing::info!(
        name = %config.node.name,
        block_size = config.dissemination.block_size,
        relay = config.dissemination.relay_after_complete,
        "node spawned"
    );

    Ok(NodeHandle {
        name: config.node.name.clone(),
        block_size: config.dissemination.block_size,
        cmd_tx,
        event_tx,
        shutdown_tx,
        handles: vec![listener, decision],
    })
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
