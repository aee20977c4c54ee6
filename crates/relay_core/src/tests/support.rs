use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::protocol::ServerEnvelope;
use tokio::sync::Notify;

use crate::writer::{ConnectionWriter, Frame, Transport, WriterConfig};

/// In-memory transport that records every frame written to it.
#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    frames: Arc<Mutex<Vec<Frame>>>,
    fail_writes: Arc<AtomicBool>,
    stall_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    hold: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl RecordingTransport {
    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames.lock().expect("frames lock").clone()
    }

    pub(crate) fn envelopes(&self) -> Vec<ServerEnvelope> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(serde_json::from_str(&text).expect("server envelope")),
                Frame::Ping(_) => None,
            })
            .collect()
    }

    pub(crate) fn pings(&self) -> usize {
        self.frames()
            .iter()
            .filter(|frame| matches!(frame, Frame::Ping(_)))
            .count()
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Makes every later write record its frame and then wait for the
    /// returned signal before reporting success.
    pub(crate) fn hold_writes(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.hold.lock().expect("hold lock") = Some(Arc::clone(&release));
        release
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&mut self, frame: Frame) -> anyhow::Result<()> {
        if self.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("broken pipe");
        }
        self.frames.lock().expect("frames lock").push(frame);
        let hold = self.hold.lock().expect("hold lock").clone();
        if let Some(release) = hold {
            release.notified().await;
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn quiet_config() -> WriterConfig {
    WriterConfig {
        ping_interval: Duration::from_secs(3600),
        write_timeout: Duration::from_millis(200),
        queue_capacity: 16,
    }
}

pub(crate) fn recording_writer() -> (ConnectionWriter, RecordingTransport) {
    recording_writer_with(quiet_config())
}

pub(crate) fn recording_writer_with(
    config: WriterConfig,
) -> (ConnectionWriter, RecordingTransport) {
    let transport = RecordingTransport::default();
    let (writer, _task) = ConnectionWriter::spawn(transport.clone(), config);
    (writer, transport)
}
