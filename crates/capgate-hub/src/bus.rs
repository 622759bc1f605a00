//! Message bus seam.
//!
//! The relay only talks to the bus through [`Bus`]. Every live handle the
//! bus hands out is a [`Feed`]: a bounded receiver plus a release hook that
//! runs exactly once, either through [`Feed::stop`] or on drop.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timeout")]
    Timeout,
    #[error("no responders")]
    NoResponders,
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("bus closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

impl KvOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            KvOperation::Put => "put",
            KvOperation::Delete => "delete",
            KvOperation::Purge => "purge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
    pub operation: KvOperation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub stream: String,
    pub subject: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub filter: String,
    /// 0 resumes from the durable cursor, or from the start for a new durable.
    pub start_seq: u64,
    /// Maximum undelivered messages in flight.
    pub batch: usize,
    pub durable: String,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

pub struct Feed<T> {
    rx: mpsc::Receiver<T>,
    release: Option<ReleaseHook>,
}

impl<T> Feed<T> {
    pub fn new(rx: mpsc::Receiver<T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }

    /// Next item, or `None` once the bus side has gone away.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn stop(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        self.rx.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        self.release_once();
    }
}

pub type Subscription = Feed<BusMessage>;
pub type KvWatch = Feed<KvEntry>;
pub type StreamConsumer = Feed<StreamMessage>;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<BusMessage, BusError>;

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError>;

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError>;

    async fn kv_delete(&self, bucket: &str, key: &str) -> Result<u64, BusError>;

    /// Current values matching `key_pattern` (all keys when `None`), then
    /// every later change.
    async fn kv_watch(&self, bucket: &str, key_pattern: Option<&str>) -> Result<KvWatch, BusError>;

    async fn consume(
        &self,
        stream: &str,
        options: ConsumerOptions,
    ) -> Result<StreamConsumer, BusError>;
}
