//! Single-writer actor for one connection.
//!
//! The actor task is the only owner of the transport. Relay notifications
//! and the periodic liveness probe both go through its queue, so frames are
//! written one at a time and in the order they were enqueued.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{domain::ConnectionId, protocol::ServerEnvelope};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
}

/// Outbound half of a live connection.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, frame: Frame) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("connection writer is closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

struct WriteRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<(), WriteError>>,
}

/// Cloneable handle to a connection's writer actor.
#[derive(Clone)]
pub struct ConnectionWriter {
    connection_id: ConnectionId,
    requests: mpsc::Sender<WriteRequest>,
    shutdown: Arc<Notify>,
    write_timeout: Duration,
}

impl ConnectionWriter {
    pub fn spawn<T: Transport>(transport: T, config: WriterConfig) -> (Self, JoinHandle<()>) {
        let connection_id = ConnectionId::new();
        let (requests, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        let write_timeout = config.write_timeout;

        let task = tokio::spawn(run_writer(
            connection_id,
            transport,
            receiver,
            Arc::clone(&shutdown),
            config,
        ));

        (
            Self {
                connection_id,
                requests,
                shutdown,
                write_timeout,
            },
            task,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub async fn send(&self, envelope: &ServerEnvelope) -> Result<(), WriteError> {
        let text = serde_json::to_string(envelope)?;
        self.send_frame(Frame::Text(text)).await
    }

    /// Queues `frame` and waits for the actor to report the transport write.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), WriteError> {
        let (reply, result) = oneshot::channel();
        match timeout(
            self.write_timeout,
            self.requests.send(WriteRequest { frame, reply }),
        )
        .await
        {
            Err(_) => return Err(WriteError::Timeout(self.write_timeout)),
            Ok(Err(_)) => return Err(WriteError::Closed),
            Ok(Ok(())) => {}
        }

        result.await.unwrap_or(Err(WriteError::Closed))
    }

    /// Asks the actor to close the transport and stop. Does not wait.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Resolves once the actor has stopped, for whatever reason.
    pub async fn closed(&self) {
        self.requests.closed().await
    }
}

impl std::fmt::Debug for ConnectionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_writer<T: Transport>(
    connection_id: ConnectionId,
    mut transport: T,
    mut requests: mpsc::Receiver<WriteRequest>,
    shutdown: Arc<Notify>,
    config: WriterConfig,
) {
    let mut probe = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                debug!(%connection_id, "connection writer asked to close");
                break;
            }
            request = requests.recv() => {
                let Some(WriteRequest { frame, reply }) = request else {
                    debug!(%connection_id, "all connection writer handles dropped");
                    break;
                };
                let result = write_frame(&mut transport, frame, config.write_timeout).await;
                let failed = result.is_err();
                if let Err(error) = &result {
                    warn!(%connection_id, %error, "write failed; closing connection writer");
                }
                let _ = reply.send(result);
                if failed {
                    break;
                }
            }
            _ = probe.tick() => {
                let ping = Frame::Ping(Vec::new());
                if let Err(error) = write_frame(&mut transport, ping, config.write_timeout).await {
                    warn!(%connection_id, %error, "liveness probe failed; closing writer");
                    break;
                }
            }
        }
    }

    // Queued requests are answered with `Closed` when their reply senders drop.
    drop(requests);
    match timeout(config.write_timeout, transport.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%connection_id, %error, "transport close failed"),
        Err(_) => debug!(%connection_id, "transport close timed out"),
    }
}

async fn write_frame<T: Transport>(
    transport: &mut T,
    frame: Frame,
    write_timeout: Duration,
) -> Result<(), WriteError> {
    match timeout(write_timeout, transport.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(WriteError::Transport(error.to_string())),
        Err(_) => Err(WriteError::Timeout(write_timeout)),
    }
}

#[cfg(test)]
#[path = "tests/writer_tests.rs"]
mod tests;
