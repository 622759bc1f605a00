//! In-process bus with broker-like semantics: subject fan-out, KV buckets
//! with revisions and watches, append-only streams with filtered consumers
//! and request/reply over generated inboxes.

use crate::bus::{
    Bus, BusError, BusMessage, ConsumerOptions, Feed, KvEntry, KvOperation, KvWatch,
    StreamConsumer, StreamMessage, Subscription,
};
use async_trait::async_trait;
use capgate_core::pattern::{is_valid_pattern, matches_any, subject_match, SINGLE_WILDCARD, TAIL_WILDCARD};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INBOX_PREFIX: &str = "_INBOX";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    next_id: AtomicU64,
    opened: AtomicUsize,
    released: AtomicUsize,
    channel_capacity: usize,
}

#[derive(Default)]
struct State {
    subscribers: HashMap<u64, Subscriber>,
    buckets: HashMap<String, Bucket>,
    streams: HashMap<String, Arc<StreamLog>>,
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct Bucket {
    revision: u64,
    entries: BTreeMap<String, KvEntry>,
    watchers: HashMap<u64, Watcher>,
}

struct Watcher {
    key_pattern: Option<String>,
    tx: mpsc::Sender<KvEntry>,
}

struct StreamLog {
    name: String,
    subjects: Vec<String>,
    messages: Mutex<Vec<StreamMessage>>,
    durables: Mutex<HashMap<String, u64>>,
    appended: Notify,
}

impl StreamLog {
    fn pending_after(&self, cursor: u64, filter: &str) -> Vec<StreamMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|msg| msg.sequence > cursor && subject_match(filter, &msg.subject))
            .cloned()
            .collect()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// `capacity` bounds every subscription and watch channel. A slow
    /// subscriber loses messages once its channel is full.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(0),
                opened: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                channel_capacity: capacity.max(1),
            }),
        }
    }

    pub fn create_bucket(&self, name: &str) -> Result<(), BusError> {
        if !is_literal_subject(name) {
            return Err(BusError::InvalidSubject(name.to_string()));
        }
        self.inner
            .state
            .lock()
            .buckets
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    /// Creates a stream capturing every published subject matching one of
    /// `subjects`. Re-creating an existing stream is a no-op.
    pub fn create_stream(&self, name: &str, subjects: &[&str]) -> Result<(), BusError> {
        if let Some(bad) = subjects.iter().find(|pattern| !is_valid_pattern(pattern)) {
            return Err(BusError::InvalidSubject(bad.to_string()));
        }
        let mut state = self.inner.state.lock();
        state.streams.entry(name.to_string()).or_insert_with(|| {
            Arc::new(StreamLog {
                name: name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                messages: Mutex::new(Vec::new()),
                durables: Mutex::new(HashMap::new()),
                appended: Notify::new(),
            })
        });
        Ok(())
    }

    /// Live handles (subscriptions, watches, consumers) not yet released.
    pub fn open_handles(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst) - self.inner.released.load(Ordering::SeqCst)
    }

    pub fn released_handles(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn track_open(&self) {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn deliver(&self, message: BusMessage) -> Result<usize, BusError> {
        if !is_literal_subject(&message.subject) {
            return Err(BusError::InvalidSubject(message.subject));
        }
        let (targets, streams) = {
            let state = self.inner.state.lock();
            let targets = state
                .subscribers
                .values()
                .filter(|sub| subject_match(&sub.pattern, &message.subject))
                .map(|sub| sub.tx.clone())
                .collect::<Vec<_>>();
            let streams = state
                .streams
                .values()
                .filter(|log| matches_any(&log.subjects, &message.subject))
                .cloned()
                .collect::<Vec<_>>();
            (targets, streams)
        };

        for log in streams {
            {
                let mut messages = log.messages.lock();
                let sequence = messages.len() as u64 + 1;
                messages.push(StreamMessage {
                    stream: log.name.clone(),
                    subject: message.subject.clone(),
                    sequence,
                    payload: message.payload.clone(),
                });
            }
            log.appended.notify_waiters();
        }

        let mut delivered = 0;
        for tx in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "bus_slow_subscriber", subject = %message.subject);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    fn kv_apply(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        operation: KvOperation,
    ) -> Result<u64, BusError> {
        if !is_literal_subject(key) {
            return Err(BusError::InvalidSubject(key.to_string()));
        }
        let mut state = self.inner.state.lock();
        let entry_bucket = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::NotFound(format!("bucket {bucket}")))?;
        entry_bucket.revision += 1;
        let entry = KvEntry {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value,
            revision: entry_bucket.revision,
            operation,
        };
        match operation {
            KvOperation::Put => {
                entry_bucket.entries.insert(key.to_string(), entry.clone());
            }
            KvOperation::Delete | KvOperation::Purge => {
                entry_bucket.entries.remove(key);
            }
        }
        for watcher in entry_bucket.watchers.values() {
            let wanted = match &watcher.key_pattern {
                Some(pattern) => subject_match(pattern, key),
                None => true,
            };
            if wanted && watcher.tx.try_send(entry.clone()).is_err() {
                warn!(event = "bus_watch_dropped", bucket = %bucket, key = %key);
            }
        }
        Ok(entry.revision)
    }

    /// Removes a key and its history marker, as a purge.
    pub fn kv_purge(&self, bucket: &str, key: &str) -> Result<u64, BusError> {
        self.kv_apply(bucket, key, Vec::new(), KvOperation::Purge)
    }

    fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription, BusError> {
        if !is_valid_pattern(pattern) {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }
        let id = self.next_id();
        let (tx, rx) = mpsc::channel(self.inner.channel_capacity);
        self.inner.state.lock().subscribers.insert(
            id,
            Subscriber {
                pattern: pattern.to_string(),
                tx,
            },
        );
        self.track_open();
        let inner = self.inner.clone();
        Ok(Feed::new(rx, move || {
            inner.state.lock().subscribers.remove(&id);
            inner.released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        })?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        self.subscribe_pattern(subject)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = format!("{INBOX_PREFIX}.{}", self.next_id());
        let mut replies = self.subscribe_pattern(&inbox)?;
        let delivered = self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: Some(inbox),
        })?;
        if delivered == 0 {
            return Err(BusError::NoResponders);
        }
        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError> {
        let state = self.inner.state.lock();
        let entries = state
            .buckets
            .get(bucket)
            .ok_or_else(|| BusError::NotFound(format!("bucket {bucket}")))?;
        Ok(entries.entries.get(key).cloned())
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError> {
        self.kv_apply(bucket, key, value, KvOperation::Put)
    }

    async fn kv_delete(&self, bucket: &str, key: &str) -> Result<u64, BusError> {
        self.kv_apply(bucket, key, Vec::new(), KvOperation::Delete)
    }

    async fn kv_watch(&self, bucket: &str, key_pattern: Option<&str>) -> Result<KvWatch, BusError> {
        if let Some(pattern) = key_pattern {
            if !is_valid_pattern(pattern) {
                return Err(BusError::InvalidSubject(pattern.to_string()));
            }
        }
        let id = self.next_id();
        let rx = {
            let mut state = self.inner.state.lock();
            let entries = state
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| BusError::NotFound(format!("bucket {bucket}")))?;
            let current = entries
                .entries
                .values()
                .filter(|entry| key_pattern.map_or(true, |p| subject_match(p, &entry.key)))
                .cloned()
                .collect::<Vec<_>>();
            let (tx, rx) = mpsc::channel(self.inner.channel_capacity + current.len());
            for entry in current {
                let _ = tx.try_send(entry);
            }
            entries.watchers.insert(
                id,
                Watcher {
                    key_pattern: key_pattern.map(str::to_string),
                    tx,
                },
            );
            rx
        };
        self.track_open();
        let inner = self.inner.clone();
        let bucket = bucket.to_string();
        Ok(Feed::new(rx, move || {
            if let Some(entries) = inner.state.lock().buckets.get_mut(&bucket) {
                entries.watchers.remove(&id);
            }
            inner.released.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn consume(
        &self,
        stream: &str,
        options: ConsumerOptions,
    ) -> Result<StreamConsumer, BusError> {
        if !is_valid_pattern(&options.filter) {
            return Err(BusError::InvalidSubject(options.filter));
        }
        let log = self
            .inner
            .state
            .lock()
            .streams
            .get(stream)
            .cloned()
            .ok_or_else(|| BusError::NotFound(format!("stream {stream}")))?;

        let (tx, rx) = mpsc::channel(options.batch.max(1));
        let stop = CancellationToken::new();
        tokio::spawn(run_consumer(log, options, tx, stop.clone()));
        self.track_open();
        let inner = self.inner.clone();
        Ok(Feed::new(rx, move || {
            stop.cancel();
            inner.released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

async fn run_consumer(
    log: Arc<StreamLog>,
    options: ConsumerOptions,
    tx: mpsc::Sender<StreamMessage>,
    stop: CancellationToken,
) {
    let mut cursor = if options.start_seq > 0 {
        options.start_seq - 1
    } else {
        log.durables
            .lock()
            .get(&options.durable)
            .copied()
            .unwrap_or(0)
    };
    debug!(event = "consumer_start", stream = %log.name, durable = %options.durable, cursor);

    loop {
        let appended = log.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        for message in log.pending_after(cursor, &options.filter) {
            let sequence = message.sequence;
            tokio::select! {
                _ = stop.cancelled() => return,
                sent = tx.send(message) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            cursor = sequence;
            log.durables.lock().insert(options.durable.clone(), cursor);
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tx.closed() => return,
            _ = &mut appended => {}
        }
    }
}

fn is_literal_subject(subject: &str) -> bool {
    is_valid_pattern(subject)
        && subject
            .split('.')
            .all(|token| token != SINGLE_WILDCARD && token != TAIL_WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_within<T>(feed: &mut Feed<T>) -> T {
        tokio::time::timeout(WAIT, feed.next())
            .await
            .expect("timeout")
            .expect("feed closed")
    }

    #[tokio::test]
    async fn publish_fans_out_to_matching_subscribers() {
        let bus = MemoryBus::new();
        let mut weather = bus.subscribe("news.weather").await.expect("sub");
        let mut all_news = bus.subscribe("news.>").await.expect("sub");
        let mut sports = bus.subscribe("sports.*").await.expect("sub");

        bus.publish("news.weather", b"rain".to_vec()).await.expect("publish");

        assert_eq!(next_within(&mut weather).await.payload, b"rain".to_vec());
        assert_eq!(next_within(&mut all_news).await.subject, "news.weather");
        let idle = tokio::time::timeout(Duration::from_millis(50), sports.next()).await;
        assert!(idle.is_err());
    }

    #[tokio::test]
    async fn wildcard_publish_is_rejected() {
        let bus = MemoryBus::new();
        let result = bus.publish("news.*", Vec::new()).await;
        assert!(matches!(result, Err(BusError::InvalidSubject(_))));
        assert!(matches!(
            bus.subscribe("a..b").await,
            Err(BusError::InvalidSubject(_))
        ));
    }

    #[tokio::test]
    async fn handles_are_counted_until_released() {
        let bus = MemoryBus::new();
        bus.create_bucket("cfg").expect("bucket");
        let sub = bus.subscribe("a").await.expect("sub");
        let watch = bus.kv_watch("cfg", None).await.expect("watch");
        assert_eq!(bus.open_handles(), 2);
        sub.stop();
        drop(watch);
        assert_eq!(bus.open_handles(), 0);
        assert_eq!(bus.released_handles(), 2);
    }

    #[tokio::test]
    async fn request_round_trips_through_inbox() {
        let bus = MemoryBus::new();
        let mut service = bus.subscribe("echo").await.expect("sub");
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = service.next().await {
                if let Some(reply) = msg.reply {
                    let _ = responder.publish(&reply, msg.payload).await;
                }
            }
        });

        let reply = bus
            .request("echo", br#"{"x":1}"#.to_vec(), WAIT)
            .await
            .expect("reply");
        assert_eq!(reply.payload, br#"{"x":1}"#.to_vec());
    }

    #[tokio::test]
    async fn request_without_responders_fails_fast() {
        let bus = MemoryBus::new();
        let result = bus.request("nobody", Vec::new(), WAIT).await;
        assert_eq!(result, Err(BusError::NoResponders));
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_when_responder_is_silent() {
        let bus = MemoryBus::new();
        let _silent = bus.subscribe("slow").await.expect("sub");
        let result = bus
            .request("slow", Vec::new(), Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(BusError::Timeout));
    }

    #[tokio::test]
    async fn kv_watch_replays_current_values_then_updates() {
        let bus = MemoryBus::new();
        bus.create_bucket("cfg").expect("bucket");
        bus.kv_put("cfg", "region.us", b"1".to_vec()).await.expect("put");
        bus.kv_put("cfg", "secret.db", b"2".to_vec()).await.expect("put");

        let mut watch = bus.kv_watch("cfg", Some("region.*")).await.expect("watch");
        let first = next_within(&mut watch).await;
        assert_eq!(first.key, "region.us");
        assert_eq!(first.revision, 1);

        bus.kv_put("cfg", "secret.db", b"3".to_vec()).await.expect("put");
        bus.kv_delete("cfg", "region.us").await.expect("delete");
        let deleted = next_within(&mut watch).await;
        assert_eq!(deleted.operation, KvOperation::Delete);
        assert_eq!(deleted.revision, 4);
        assert_eq!(bus.kv_get("cfg", "region.us").await.expect("get"), None);
    }

    #[tokio::test]
    async fn missing_bucket_and_stream_are_not_found() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.kv_watch("nope", None).await,
            Err(BusError::NotFound(_))
        ));
        let options = ConsumerOptions {
            filter: "a.>".to_string(),
            start_seq: 0,
            batch: 10,
            durable: "d".to_string(),
        };
        assert!(matches!(
            bus.consume("nope", options).await,
            Err(BusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn consumer_filters_and_resumes_from_durable_cursor() {
        let bus = MemoryBus::new();
        bus.create_stream("ORDERS", &["orders.>"]).expect("stream");
        for subject in ["orders.eu.1", "orders.us.1", "orders.eu.2"] {
            bus.publish(subject, subject.as_bytes().to_vec())
                .await
                .expect("publish");
        }
        let options = ConsumerOptions {
            filter: "orders.eu.*".to_string(),
            start_seq: 0,
            batch: 10,
            durable: "ws_a".to_string(),
        };

        let mut consumer = bus.consume("ORDERS", options.clone()).await.expect("consume");
        assert_eq!(next_within(&mut consumer).await.sequence, 1);
        assert_eq!(next_within(&mut consumer).await.sequence, 3);
        consumer.stop();

        bus.publish("orders.eu.3", Vec::new()).await.expect("publish");
        let mut resumed = bus.consume("ORDERS", options.clone()).await.expect("consume");
        let next = next_within(&mut resumed).await;
        assert_eq!(next.sequence, 4);
        assert_eq!(next.subject, "orders.eu.3");

        let mut replay = bus
            .consume(
                "ORDERS",
                ConsumerOptions {
                    start_seq: 2,
                    durable: "ws_b".to_string(),
                    ..options
                },
            )
            .await
            .expect("consume");
        assert_eq!(next_within(&mut replay).await.sequence, 3);
    }

    #[tokio::test]
    async fn consumer_wakes_on_append() {
        let bus = MemoryBus::new();
        bus.create_stream("S", &["s.>"]).expect("stream");
        let mut consumer = bus
            .consume(
                "S",
                ConsumerOptions {
                    filter: "s.>".to_string(),
                    start_seq: 1,
                    batch: 1,
                    durable: "d".to_string(),
                },
            )
            .await
            .expect("consume");
        bus.publish("s.x", b"late".to_vec()).await.expect("publish");
        assert_eq!(next_within(&mut consumer).await.payload, b"late".to_vec());
    }
}
