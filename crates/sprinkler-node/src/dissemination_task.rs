//! Dissemination background tasks -- the serialized decision loop and the
//! transport listener that feeds it.
//!
//! Decision loop selects over:
//!   1. next engine deadline -> poll_timers
//!   2. inbound messages (from the listener) -> handle_message
//!   3. decode results (from the blocking pool) -> on_decode_result
//!   4. session commands (publish / status / stop / start)
//!   5. shutdown
//!
//! Every engine call returns EngineActions: datagrams go to the transport,
//! decode jobs to spawn_blocking, session events to the broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use sprinkler_dissemination::{
    Coder, CoderError, DecodeJob, DecodeOutcome, DisseminationEngine, EngineActions, EngineError,
    SessionEvent, SessionStatus, SourceBlocks,
};
use sprinkler_protocol::{decode_datagram, encode_datagram, Message, Version};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::transport::Transport;

/// Requests from a `NodeHandle` to the decision loop.
#[derive(Debug)]
pub enum SessionCommand {
    Publish {
        version: Version,
        content: SourceBlocks,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    /// Cancel timers, drop the session and drain queued datagrams.
    Stop { reply: oneshot::Sender<()> },
    /// Resume beaconing after a stop.
    Start { reply: oneshot::Sender<()> },
}

struct DecodeDone {
    job_id: u64,
    version: Version,
    result: Result<DecodeOutcome, CoderError>,
}

/// The engine's notion of now. Goes through tokio's clock so paused-time
/// tests drive it too.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Run the decision loop until shutdown or until every handle is gone.
pub async fn run_dissemination_loop<T: Transport>(
    mut engine: DisseminationEngine,
    coder: Arc<dyn Coder>,
    transport: Arc<T>,
    mut inbound_rx: mpsc::Receiver<Message>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (decode_tx, mut decode_rx) = mpsc::unbounded_channel::<DecodeDone>();
    let max_datagram = transport.max_datagram_bytes();
    let ctx = Dispatch {
        coder,
        transport,
        decode_tx,
        event_tx,
        max_datagram,
    };

    engine.start(now());
    tracing::info!(coder = ctx.coder.name(), "dissemination loop started");

    loop {
        let deadline = engine.next_deadline();
        tokio::select! {
            _ = sleep_until(deadline) => {
                let actions = engine.poll_timers(now());
                ctx.apply(actions).await;
            }

            Some(message) = inbound_rx.recv() => {
                tracing::trace!(kind = ?message.kind(), version = message.version(), "inbound");
                let actions = engine.handle_message(now(), message);
                ctx.apply(actions).await;
            }

            Some(done) = decode_rx.recv() => {
                let actions = engine.on_decode_result(now(), done.job_id, done.version, done.result);
                ctx.apply(actions).await;
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::info!("all node handles dropped, dissemination loop exiting");
                    let actions = engine.stop();
                    ctx.apply(actions).await;
                    return;
                };
                match cmd {
                    SessionCommand::Publish { version, content, reply } => {
                        match engine.publish(now(), version, content) {
                            Ok(actions) => {
                                ctx.apply(actions).await;
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                tracing::warn!(version, error = %e, "publish rejected");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    SessionCommand::Status { reply } => {
                        let _ = reply.send(engine.status());
                    }
                    SessionCommand::Stop { reply } => {
                        let actions = engine.stop();
                        let mut drained = 0usize;
                        while inbound_rx.try_recv().is_ok() {
                            drained += 1;
                        }
                        tracing::info!(drained, "session stopped, inbound queue drained");
                        ctx.apply(actions).await;
                        let _ = reply.send(());
                    }
                    SessionCommand::Start { reply } => {
                        engine.start(now());
                        let _ = reply.send(());
                    }
                }
            }

            _ = shutdown.recv() => {
                tracing::info!("dissemination shutting down");
                let actions = engine.stop();
                ctx.apply(actions).await;
                return;
            }
        }
    }
}

/// Where engine actions go.
struct Dispatch<T> {
    coder: Arc<dyn Coder>,
    transport: Arc<T>,
    decode_tx: mpsc::UnboundedSender<DecodeDone>,
    event_tx: broadcast::Sender<SessionEvent>,
    max_datagram: usize,
}

impl<T: Transport> Dispatch<T> {
    async fn apply(&self, actions: EngineActions) {
        for message in actions.send {
            let kind = message.kind();
            let datagram = match encode_datagram(message, self.max_datagram) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(?kind, error = %e, "failed to encode outbound message");
                    continue;
                }
            };
            if let Err(e) = self.transport.send(datagram).await {
                tracing::warn!(?kind, error = %e, "transient send error, datagram dropped");
            }
        }

        if let Some(job) = actions.decode {
            self.spawn_decode(job);
        }

        for event in actions.events {
            log_event(&event);
            // No subscribers is fine.
            let _ = self.event_tx.send(event);
        }
    }

    fn spawn_decode(&self, job: DecodeJob) {
        let coder = self.coder.clone();
        let tx = self.decode_tx.clone();
        tracing::debug!(
            job_id = job.job_id,
            version = job.version,
            symbols = job.symbols.len(),
            "decode attempt started"
        );
        tokio::task::spawn_blocking(move || {
            let result = coder.try_decode(&job.symbols, job.layout);
            // The loop may have exited; nothing to report to then.
            let _ = tx.send(DecodeDone {
                job_id: job.job_id,
                version: job.version,
                result,
            });
        });
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Completed(t) => tracing::info!(
            version = t.version,
            file_len = t.content.file_len(),
            summary = %t.summary,
            "transfer complete"
        ),
        SessionEvent::Aborted { version, reason } => {
            tracing::info!(version, reason = reason.as_str(), "session aborted")
        }
        SessionEvent::Superseded { old, new } => {
            tracing::info!(old, new, "session superseded")
        }
        SessionEvent::Inconsistency {
            version,
            local,
            remote,
        } => tracing::warn!(version, %local, %remote, "inconsistent content for same version"),
    }
}

/// Read datagrams off the transport and queue decoded messages for the
/// decision loop. A full queue drops the datagram.
pub async fn run_listener<T: Transport>(
    transport: Arc<T>,
    inbound_tx: mpsc::Sender<Message>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let max_datagram = transport.max_datagram_bytes();
    let mut queue_drops: u64 = 0;
    loop {
        tokio::select! {
            received = transport.recv() => {
                let datagram = match received {
                    Ok(d) => d,
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        tracing::info!("transport closed, listener exiting");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "transient receive error");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                let message = match decode_datagram(&datagram, max_datagram) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(len = datagram.len(), error = %e, "dropping malformed datagram");
                        continue;
                    }
                };
                match inbound_tx.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        queue_drops += 1;
                        if queue_drops.is_power_of_two() {
                            tracing::warn!(queue_drops, "inbound queue full, dropping datagrams");
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }

            _ = shutdown.recv() => {
                tracing::debug!("listener shutting down");
                return;
            }
        }
    }
}
