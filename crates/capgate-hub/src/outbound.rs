//! Per-session outbound queue and the single writer that owns the sink.

use crate::lifecycle::{CloseReason, Closer, SessionError};
use axum::extract::ws::Message;
use capgate_core::{encode_frame, ServerFrame};
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::{Instant, Interval};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
    enqueue_timeout: Duration,
    max_frame_bytes: usize,
    closer: Closer,
    conn_id: Arc<str>,
}

pub fn channel(
    capacity: usize,
    enqueue_timeout: Duration,
    max_frame_bytes: usize,
    closer: Closer,
    conn_id: &str,
) -> (Outbound, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let outbound = Outbound {
        tx,
        enqueue_timeout,
        max_frame_bytes,
        closer,
        conn_id: Arc::from(conn_id),
    };
    (outbound, rx)
}

impl Outbound {
    /// Queues a frame for the writer. Waiting longer than the enqueue
    /// timeout closes the whole session.
    pub async fn enqueue(&self, frame: &ServerFrame) -> Result<(), SessionError> {
        if self.closer.is_closed() {
            return Err(SessionError::Closed);
        }
        let text = match encode_frame(frame, self.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_encode_error", conn_id = %self.conn_id, error = %err);
                return Err(err.into());
            }
        };
        match self
            .tx
            .send_timeout(Message::Text(text), self.enqueue_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                if self.closer.close(CloseReason::Backpressure) {
                    warn!(
                        event = "send_backpressure",
                        conn_id = %self.conn_id,
                        timeout_ms = self.enqueue_timeout.as_millis() as u64
                    );
                }
                Err(SessionError::Backpressure)
            }
            Err(SendTimeoutError::Closed(_)) => Err(SessionError::Closed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub write_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub max_frame_bytes: usize,
}

pub async fn run_writer<W>(
    conn_id: String,
    mut sink: W,
    mut rx: mpsc::Receiver<Message>,
    closer: Closer,
    config: WriterConfig,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = config
        .ping_interval
        .filter(|period| !period.is_zero())
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        let next = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = next_ping(&mut ping) => Message::Ping(Vec::new()),
        };
        if let Err(err) = write_bounded(&mut sink, next, config.write_timeout).await {
            warn!(event = "write_error", conn_id = %conn_id, error = %err);
            closer.close(CloseReason::WriteFailed);
            break;
        }
    }
    drop(rx);

    if let Some(reason) = closer.reason().and_then(CloseReason::client_reason) {
        if let Ok(text) = encode_frame(&ServerFrame::error(reason), config.max_frame_bytes) {
            let _ = write_bounded(&mut sink, Message::Text(text), config.write_timeout).await;
        }
    }
    if tokio::time::timeout(config.write_timeout, sink.close())
        .await
        .is_err()
    {
        debug!(event = "close_timeout", conn_id = %conn_id);
    }
}

async fn write_bounded<W>(sink: &mut W, msg: Message, write_timeout: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(write_timeout, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("write timeout".to_string()),
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
