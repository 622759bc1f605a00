//! One client connection: capability snapshot, subscription registry,
//! outbound queue and every task working on their behalf.

use crate::auth_store::{decode_entry, CapabilityStore};
use crate::bus::{Bus, BusMessage, ConsumerOptions, Feed, KvEntry, StreamMessage};
use crate::config::SessionConfig;
use crate::lifecycle::{CloseReason, Closer, Phase, SessionError};
use crate::outbound::{self, Outbound, WriterConfig};
use crate::registry::{Registration, Registry, SubscriptionKind};
use axum::extract::ws::Message;
use capgate_core::{
    decode_client_frame, durable_name, payload_value, CapabilitySet, ClientFrame, ClientOp,
    ServerFrame,
};
use futures_util::{Sink, Stream, StreamExt};
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct SessionParams {
    pub conn_id: String,
    pub identity: String,
    pub bus: Arc<dyn Bus>,
    pub store: CapabilityStore,
    pub config: SessionConfig,
    pub cancel: CancellationToken,
}

struct SessionState {
    phase: Phase,
    caps: Arc<CapabilitySet>,
    registry: Registry,
}

struct Session {
    conn_id: String,
    identity: String,
    bus: Arc<dyn Bus>,
    store: CapabilityStore,
    config: SessionConfig,
    closer: Closer,
    outbound: Outbound,
    tracker: TaskTracker,
    state: Mutex<SessionState>,
}

/// Drives a connection until the client leaves, the transport fails, the
/// session is closed for backpressure, or the hub shuts down. Returns only
/// after every subscription has been released and every task has exited.
pub async fn run_session<R, W, E>(params: SessionParams, mut reader: R, writer: W) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    let caps = params.store.load(&params.identity).await;
    let closer = Closer::new(params.cancel);
    let (outbound, rx) = outbound::channel(
        params.config.queue_capacity,
        params.config.enqueue_timeout,
        params.config.max_frame_bytes,
        closer.clone(),
        &params.conn_id,
    );
    let session = Arc::new(Session {
        conn_id: params.conn_id,
        identity: params.identity,
        bus: params.bus,
        store: params.store,
        config: params.config,
        closer,
        outbound,
        tracker: TaskTracker::new(),
        state: Mutex::new(SessionState {
            phase: Phase::Active,
            caps: Arc::new(caps),
            registry: Registry::default(),
        }),
    });

    let writer_config = WriterConfig {
        write_timeout: session.config.write_timeout,
        ping_interval: session.config.ping_interval,
        max_frame_bytes: session.config.max_frame_bytes,
    };
    session.tracker.spawn(outbound::run_writer(
        session.conn_id.clone(),
        writer,
        rx,
        session.closer.clone(),
        writer_config,
    ));
    session.tracker.spawn(session.clone().watch_capabilities());

    info!(
        event = "session_open",
        conn_id = %session.conn_id,
        identity = %session.identity
    );

    loop {
        let next = tokio::select! {
            biased;
            _ = session.closer.cancelled() => break,
            next = reader.next() => next,
        };
        let data = match next {
            None => {
                session.closer.close(CloseReason::ClientClosed);
                break;
            }
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = %session.conn_id, error = %err);
                session.closer.close(CloseReason::Transport);
                break;
            }
            Some(Ok(msg)) => match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %session.conn_id);
                    session.closer.close(CloseReason::ClientClosed);
                    break;
                }
            },
        };
        session.handle_raw(&data).await;
    }

    session.teardown().await
}

impl Session {
    async fn handle_raw(self: &Arc<Self>, data: &[u8]) {
        let frame = match decode_client_frame(data, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(event = "frame_invalid", conn_id = %self.conn_id, error = %err);
                self.send_error(&err.reason()).await;
                return;
            }
        };
        match frame.op {
            ClientOp::Sub => self.handle_sub(frame).await,
            ClientOp::Unsub => self.handle_unsub(frame).await,
            ClientOp::KvSub => self.handle_kv_sub(frame).await,
            ClientOp::JsSub => self.handle_js_sub(frame).await,
            ClientOp::Cmd => self.handle_cmd(frame).await,
        }
    }

    async fn send_error(&self, reason: &str) {
        let _ = self.outbound.enqueue(&ServerFrame::error(reason)).await;
    }

    /// The session lock, or `None` once teardown has begun.
    async fn active_state(&self) -> Option<MutexGuard<'_, SessionState>> {
        let state = self.state.lock().await;
        (state.phase == Phase::Active).then_some(state)
    }

    fn denied(&self, op: ClientOp, target: &str) {
        debug!(event = "op_denied", conn_id = %self.conn_id, op = op.as_str(), target = %target);
    }

    async fn handle_sub(self: &Arc<Self>, frame: ClientFrame) {
        let target = frame.target;
        let Some(mut state) = self.active_state().await else {
            return;
        };
        if !state.caps.allows_subject(&target) {
            self.denied(ClientOp::Sub, &target);
            return;
        }
        let feed = match self.bus.subscribe(&target).await {
            Ok(feed) => feed,
            Err(err) => {
                drop(state);
                warn!(event = "sub_error", conn_id = %self.conn_id, target = %target, error = %err);
                self.send_error(&format!("subscribe failed: {err}")).await;
                return;
            }
        };
        self.register(&mut state, target, SubscriptionKind::Subject, feed, render_subject)
            .await;
    }

    async fn handle_unsub(self: &Arc<Self>, frame: ClientFrame) {
        let Some(mut state) = self.active_state().await else {
            return;
        };
        for ((kind, target), registration) in state.registry.remove_target(&frame.target) {
            registration.stop().await;
            debug!(
                event = "unsubscribed",
                conn_id = %self.conn_id,
                kind = kind.as_str(),
                target = %target
            );
        }
    }

    async fn handle_kv_sub(self: &Arc<Self>, frame: ClientFrame) {
        let options = match frame.kv_options() {
            Ok(options) => options,
            Err(err) => {
                self.send_error(&err.reason()).await;
                return;
            }
        };
        let key_pattern = options
            .pattern
            .map(|pattern| pattern.trim().to_string())
            .filter(|pattern| !pattern.is_empty());
        let bucket = frame.target;

        let Some(mut state) = self.active_state().await else {
            return;
        };
        if !state.caps.allows_bucket(&bucket, key_pattern.as_deref()) {
            self.denied(ClientOp::KvSub, &bucket);
            return;
        }
        let feed = match self.bus.kv_watch(&bucket, key_pattern.as_deref()).await {
            Ok(feed) => feed,
            Err(err) => {
                drop(state);
                warn!(event = "kv_watch_error", conn_id = %self.conn_id, bucket = %bucket, error = %err);
                self.send_error(&format!("kv watch failed: {err}")).await;
                return;
            }
        };
        let kind = SubscriptionKind::KeyValueWatch { key_pattern };
        self.register(&mut state, bucket, kind, feed, render_kv).await;
    }

    async fn handle_js_sub(self: &Arc<Self>, frame: ClientFrame) {
        let options = match frame.js_options() {
            Ok(options) => options,
            Err(err) => {
                self.send_error(&err.reason()).await;
                return;
            }
        };
        let filter = options.filter.trim().to_string();
        if filter.is_empty() {
            self.send_error("js_sub requires a filter").await;
            return;
        }
        let stream = frame.target;

        let Some(mut state) = self.active_state().await else {
            return;
        };
        if !state.caps.allows_stream(&stream, Some(&filter)) {
            self.denied(ClientOp::JsSub, &stream);
            return;
        }
        let durable = durable_name(&self.identity, &stream, &filter);
        let consumer = ConsumerOptions {
            filter: filter.clone(),
            start_seq: options.start_seq,
            batch: self.config.effective_batch(options.batch),
            durable: durable.clone(),
        };
        let feed = match self.bus.consume(&stream, consumer).await {
            Ok(feed) => feed,
            Err(err) => {
                drop(state);
                warn!(event = "consume_error", conn_id = %self.conn_id, stream = %stream, error = %err);
                self.send_error(&format!("stream consume failed: {err}")).await;
                return;
            }
        };
        let kind = SubscriptionKind::StreamConsumer { filter, durable };
        self.register(&mut state, stream, kind, feed, render_stream).await;
    }

    async fn handle_cmd(self: &Arc<Self>, frame: ClientFrame) {
        {
            let Some(state) = self.active_state().await else {
                return;
            };
            if !state.caps.allows_command(&frame.target) {
                self.denied(ClientOp::Cmd, &frame.target);
                return;
            }
        }
        let payload = frame.command_payload();
        let session = self.clone();
        self.tracker.spawn(async move {
            let timeout = session.config.command_timeout;
            let outcome = tokio::select! {
                biased;
                _ = session.closer.cancelled() => return,
                outcome = tokio::time::timeout(timeout, session.bus.request(&frame.target, payload, timeout)) => outcome,
            };
            let reply = match outcome {
                Ok(Ok(msg)) => ServerFrame::reply(&frame.target, frame.inbox, payload_value(&msg.payload)),
                Ok(Err(err)) => ServerFrame::reply_error(&frame.target, frame.inbox, &err.to_string()),
                Err(_) => ServerFrame::reply_error(&frame.target, frame.inbox, "timeout"),
            };
            let _ = session.outbound.enqueue(&reply).await;
        });
    }

    /// Starts the delivery task and stores it, stopping whatever was
    /// previously registered under the same key. Runs under the session lock.
    async fn register<T>(
        &self,
        state: &mut SessionState,
        target: String,
        kind: SubscriptionKind,
        feed: Feed<T>,
        render: fn(&str, T) -> ServerFrame,
    ) where
        T: Send + 'static,
    {
        let stop = self.closer.token().child_token();
        let task = self.tracker.spawn(deliver(
            self.outbound.clone(),
            target.clone(),
            feed,
            render,
            stop.clone(),
        ));
        let target_kind = kind.target_kind();
        let registration = Registration::new(kind, stop, task);
        if let Some(previous) = state.registry.insert(target.clone(), registration) {
            previous.stop().await;
            debug!(event = "subscription_replaced", conn_id = %self.conn_id, target = %target);
        }
        info!(
            event = "subscribed",
            conn_id = %self.conn_id,
            kind = target_kind.as_str(),
            target = %target
        );
    }

    async fn watch_capabilities(self: Arc<Self>) {
        let key = self.store.key_for(&self.identity).to_string();
        let mut watch = match self.store.watch(&self.identity).await {
            Ok(watch) => watch,
            Err(err) => {
                error!(
                    event = "caps_watch_error",
                    conn_id = %self.conn_id,
                    key = %key,
                    error = %err
                );
                return;
            }
        };
        loop {
            let entry = tokio::select! {
                biased;
                _ = self.closer.cancelled() => break,
                entry = watch.next() => match entry {
                    Some(entry) => entry,
                    None => {
                        warn!(event = "caps_watch_closed", conn_id = %self.conn_id);
                        break;
                    }
                },
            };
            if entry.key != key {
                continue;
            }
            self.apply_capabilities(decode_entry(&entry), entry.revision)
                .await;
        }
        watch.stop();
    }

    /// Revokes what the new set no longer grants, then swaps it in and
    /// notifies the client. Unchanged sets are ignored.
    async fn apply_capabilities(&self, caps: CapabilitySet, revision: u64) {
        let snapshot = {
            let Some(mut state) = self.active_state().await else {
                return;
            };
            if *state.caps == caps {
                return;
            }
            let revoked = state.registry.revoke(&caps);
            let count = revoked.len();
            for ((kind, target), registration) in revoked {
                registration.stop().await;
                info!(
                    event = "subscription_revoked",
                    conn_id = %self.conn_id,
                    kind = kind.as_str(),
                    target = %target
                );
            }
            state.caps = Arc::new(caps);
            info!(
                event = "caps_updated",
                conn_id = %self.conn_id,
                revision,
                revoked = count
            );
            state.caps.clone()
        };
        let _ = self.outbound.enqueue(&ServerFrame::cap_update(&snapshot)).await;
    }

    async fn teardown(&self) -> CloseReason {
        self.closer.close(CloseReason::Shutdown);
        let reason = self.closer.reason().unwrap_or(CloseReason::Shutdown);
        let released = {
            let mut state = self.state.lock().await;
            state.phase = Phase::Closing;
            let registrations = state.registry.drain();
            let count = registrations.len();
            for registration in registrations {
                registration.stop().await;
            }
            count
        };
        self.tracker.close();
        self.tracker.wait().await;
        self.state.lock().await.phase = Phase::Closed;
        info!(
            event = "session_closed",
            conn_id = %self.conn_id,
            identity = %self.identity,
            reason = reason.as_str(),
            released
        );
        reason
    }
}

async fn deliver<T>(
    outbound: Outbound,
    target: String,
    mut feed: Feed<T>,
    render: fn(&str, T) -> ServerFrame,
    stop: CancellationToken,
) where
    T: Send + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            item = feed.next() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let frame = render(&target, item);
        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = outbound.enqueue(&frame) => sent,
        };
        match sent {
            Ok(()) | Err(SessionError::Frame(_)) => {}
            Err(SessionError::Closed | SessionError::Backpressure) => break,
        }
    }
    feed.stop();
}

fn render_subject(target: &str, msg: BusMessage) -> ServerFrame {
    ServerFrame::msg(target, payload_value(&msg.payload))
}

fn render_kv(target: &str, entry: KvEntry) -> ServerFrame {
    ServerFrame::msg(
        target,
        json!({
            "key": entry.key,
            "value": String::from_utf8_lossy(&entry.value),
            "rev": entry.revision,
            "op": entry.operation.as_str(),
        }),
    )
}

fn render_stream(target: &str, msg: StreamMessage) -> ServerFrame {
    let data: Value = payload_value(&msg.payload);
    ServerFrame::msg(
        target,
        json!({
            "seq": msg.sequence,
            "subject": msg.subject,
            "data": data,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_store::{DEFAULT_ANONYMOUS_KEY, DEFAULT_AUTH_BUCKET};
    use crate::memory_bus::MemoryBus;
    use capgate_core::ServerOp;
    use futures::channel::mpsc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(150);

    type Inbound = Result<Message, std::io::Error>;

    struct Harness {
        bus: MemoryBus,
        store: CapabilityStore,
        to_server: mpsc::UnboundedSender<Inbound>,
        from_server: mpsc::Receiver<Message>,
        cancel: CancellationToken,
        session: JoinHandle<CloseReason>,
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            ping_interval: None,
            command_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        }
    }

    fn grants(build: impl FnOnce(&mut CapabilitySet)) -> CapabilitySet {
        let mut caps = CapabilitySet::deny_all();
        build(&mut caps);
        caps
    }

    impl Harness {
        async fn start(identity: &str, caps: Option<CapabilitySet>) -> Self {
            Self::start_with(identity, caps, test_config(), 64).await
        }

        async fn start_with(
            identity: &str,
            caps: Option<CapabilitySet>,
            config: SessionConfig,
            client_buffer: usize,
        ) -> Self {
            let bus = MemoryBus::new();
            bus.create_bucket(DEFAULT_AUTH_BUCKET).expect("auth bucket");
            let store = CapabilityStore::new(
                Arc::new(bus.clone()),
                DEFAULT_AUTH_BUCKET,
                DEFAULT_ANONYMOUS_KEY,
            );
            if let Some(caps) = caps {
                store.put(identity, &caps).await.expect("seed caps");
            }
            let (to_server, reader) = mpsc::unbounded::<Inbound>();
            let (writer, from_server) = mpsc::channel::<Message>(client_buffer);
            let cancel = CancellationToken::new();
            let params = SessionParams {
                conn_id: "conn-test".to_string(),
                identity: identity.to_string(),
                bus: Arc::new(bus.clone()),
                store: store.clone(),
                config,
                cancel: cancel.clone(),
            };
            let session = tokio::spawn(run_session(params, reader, writer));
            let harness = Self {
                bus,
                store,
                to_server,
                from_server,
                cancel,
                session,
            };
            // The capability watch is the last handle opened during startup.
            harness.wait_for_handles(1).await;
            harness
        }

        fn send(&self, raw: &str) {
            self.to_server
                .unbounded_send(Ok(Message::Text(raw.to_string())))
                .expect("send");
        }

        async fn recv(&mut self) -> Value {
            loop {
                let msg = tokio::time::timeout(WAIT, self.from_server.next())
                    .await
                    .expect("timed out waiting for frame")
                    .expect("session closed");
                if let Message::Text(text) = msg {
                    return serde_json::from_str(&text).expect("json frame");
                }
            }
        }

        async fn expect_quiet(&mut self) {
            let next = tokio::time::timeout(QUIET, self.from_server.next()).await;
            assert!(next.is_err(), "unexpected frame: {next:?}");
        }

        async fn wait_for_handles(&self, open: usize) {
            for _ in 0..200 {
                if self.bus.open_handles() == open {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(self.bus.open_handles(), open);
        }

        async fn publish(&self, subject: &str, payload: &str) {
            self.bus
                .publish(subject, payload.as_bytes().to_vec())
                .await
                .expect("publish");
        }

        async fn close(self) -> (CloseReason, MemoryBus) {
            drop(self.to_server);
            let reason = tokio::time::timeout(WAIT, self.session)
                .await
                .expect("session bounded")
                .expect("join");
            (reason, self.bus)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sub_delivers_only_authorized_subjects() {
        let caps = grants(|caps| caps.subjects = vec!["news.*".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;

        h.send(r#"{"op":"sub","target":"news.weather"}"#);
        h.send(r#"{"op":"sub","target":"alerts.fire"}"#);
        h.wait_for_handles(2).await;

        h.publish("alerts.fire", r#"{"level":5}"#).await;
        h.publish("news.weather", r#"{"temp":21}"#).await;
        let frame = h.recv().await;
        assert_eq!(frame["op"], "msg");
        assert_eq!(frame["target"], "news.weather");
        assert_eq!(frame["data"], json!({"temp": 21}));
        h.expect_quiet().await;

        let (reason, bus) = h.close().await;
        assert_eq!(reason, CloseReason::ClientClosed);
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kv_sub_delivers_only_keys_matching_requested_pattern() {
        let caps = grants(|caps| {
            caps.buckets
                .insert("cfg.*".to_string(), vec!["region.>".to_string()]);
        });
        let mut h = Harness::start("alice", Some(caps)).await;
        h.bus.create_bucket("cfg.prod").expect("bucket");

        h.send(r#"{"op":"kv_sub","target":"cfg.prod","data":{"pattern":"region.us"}}"#);
        h.wait_for_handles(2).await;

        h.bus.kv_put("cfg.prod", "region.eu", b"x".to_vec()).await.expect("put");
        h.bus.kv_put("cfg.prod", "region.us", b"on".to_vec()).await.expect("put");
        let frame = h.recv().await;
        assert_eq!(frame["target"], "cfg.prod");
        assert_eq!(frame["data"]["key"], "region.us");
        assert_eq!(frame["data"]["value"], "on");
        assert_eq!(frame["data"]["rev"], 2);
        assert_eq!(frame["data"]["op"], "put");
        h.expect_quiet().await;

        h.send(r#"{"op":"kv_sub","target":"cfg.prod","data":{"pattern":"secrets.>"}}"#);
        h.send(r#"{"op":"kv_sub","target":"cfg.prod"}"#);
        h.expect_quiet().await;
        assert_eq!(h.bus.open_handles(), 2);

        let (_, bus) = h.close().await;
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capability_update_revokes_and_notifies() {
        let caps = grants(|caps| caps.subjects = vec!["news.*".to_string(), "time.>".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;
        h.send(r#"{"op":"sub","target":"news.weather"}"#);
        h.send(r#"{"op":"sub","target":"time.utc"}"#);
        h.wait_for_handles(3).await;

        let narrowed = grants(|caps| caps.subjects = vec!["time.>".to_string()]);
        h.store.put("alice", &narrowed).await.expect("update");
        let update = h.recv().await;
        assert_eq!(update["op"], "cap_update");
        assert_eq!(update["data"]["subjects"], json!(["time.>"]));
        assert_eq!(h.bus.open_handles(), 2);

        h.publish("news.weather", "rain").await;
        h.publish("time.utc", "noon").await;
        let frame = h.recv().await;
        assert_eq!(frame["target"], "time.utc");
        assert_eq!(frame["data"], "noon");
        h.expect_quiet().await;

        h.send(r#"{"op":"sub","target":"news.sports"}"#);
        h.expect_quiet().await;
        assert_eq!(h.bus.open_handles(), 2);
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deleted_entry_revokes_everything() {
        let caps = grants(|caps| caps.subjects = vec![">".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;
        h.send(r#"{"op":"sub","target":"a.b"}"#);
        h.wait_for_handles(2).await;

        h.bus.kv_delete(DEFAULT_AUTH_BUCKET, "alice").await.expect("delete");
        let update = h.recv().await;
        assert_eq!(update["op"], "cap_update");
        assert_eq!(update["data"]["subjects"], json!([]));
        assert_eq!(h.bus.open_handles(), 1);
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsub_and_close_release_every_handle() {
        let caps = grants(|caps| {
            caps.subjects = vec!["a.>".to_string()];
            caps.buckets.insert("cfg".to_string(), vec![">".to_string()]);
        });
        let h = Harness::start("alice", Some(caps)).await;
        h.bus.create_bucket("cfg").expect("bucket");

        h.send(r#"{"op":"sub","target":"a.one"}"#);
        h.send(r#"{"op":"sub","target":"a.two"}"#);
        h.send(r#"{"op":"kv_sub","target":"cfg"}"#);
        h.wait_for_handles(4).await;
        h.send(r#"{"op":"unsub","target":"a.one"}"#);
        h.send(r#"{"op":"unsub","target":"cfg"}"#);
        h.send(r#"{"op":"unsub","target":"never.subscribed"}"#);
        h.wait_for_handles(2).await;

        let (_, bus) = h.close().await;
        assert_eq!(bus.open_handles(), 0);
        assert_eq!(bus.released_handles(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_sub_replaces_previous_registration() {
        let caps = grants(|caps| caps.subjects = vec!["news.*".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;
        h.send(r#"{"op":"sub","target":"news.weather"}"#);
        h.wait_for_handles(2).await;
        h.send(r#"{"op":"sub","target":"news.weather"}"#);
        for _ in 0..200 {
            if h.bus.released_handles() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.bus.released_handles(), 1);
        assert_eq!(h.bus.open_handles(), 2);

        h.publish("news.weather", "once").await;
        assert_eq!(h.recv().await["data"], "once");
        h.expect_quiet().await;

        h.send(r#"{"op":"unsub","target":"news.weather"}"#);
        h.wait_for_handles(1).await;
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frames_get_error_and_session_survives() {
        let caps = grants(|caps| caps.subjects = vec!["ok".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;

        h.send("{not json");
        assert_eq!(h.recv().await, json!({"op": "error", "data": {"reason": "bad json"}}));
        h.send(r#"{"op":"publish","target":"ok"}"#);
        assert_eq!(h.recv().await["op"], "error");
        h.send(r#"{"op":"sub","target":""}"#);
        assert_eq!(h.recv().await["data"]["reason"], "sub requires a target");
        h.send(r#"{"op":"kv_sub","target":"b","data":{"pattern":1}}"#);
        assert_eq!(h.recv().await["op"], "error");

        h.to_server
            .unbounded_send(Ok(Message::Binary(br#"{"op":"sub","target":"ok"}"#.to_vec())))
            .expect("send");
        h.wait_for_handles(2).await;
        h.publish("ok", "still here").await;
        assert_eq!(h.recv().await["data"], "still here");
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_frame_is_rejected_without_closing() {
        let config = SessionConfig {
            max_frame_bytes: 64,
            ..test_config()
        };
        let mut h = Harness::start_with("alice", None, config, 64).await;
        h.send(&format!(r#"{{"op":"sub","target":"{}"}}"#, "x".repeat(100)));
        assert_eq!(h.recv().await["data"]["reason"], "frame too large");
        let (reason, _) = h.close().await;
        assert_eq!(reason, CloseReason::ClientClosed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn denied_ops_are_silent() {
        let mut h = Harness::start("", None).await;
        h.send(r#"{"op":"sub","target":"news.weather"}"#);
        h.send(r#"{"op":"kv_sub","target":"cfg","data":{"pattern":"a"}}"#);
        h.send(r#"{"op":"js_sub","target":"ORDERS","data":{"filter":"orders.>"}}"#);
        h.send(r#"{"op":"cmd","target":"echo","inbox":"i-1"}"#);
        h.expect_quiet().await;
        assert_eq!(h.bus.open_handles(), 1);
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn anonymous_identity_uses_anonymous_entry() {
        let caps = grants(|caps| caps.subjects = vec!["time.>".to_string()]);
        let mut h = Harness::start("", Some(caps)).await;
        h.send(r#"{"op":"sub","target":"time.utc"}"#);
        h.wait_for_handles(2).await;
        h.publish("time.utc", "tick").await;
        assert_eq!(h.recv().await["data"], "tick");
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_reply_with_matching_inbox() {
        let caps = grants(|caps| caps.commands = vec!["echo".to_string(), "silent".to_string(), "nobody".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;

        let mut service = h.bus.subscribe("echo").await.expect("responder");
        let _silent = h.bus.subscribe("silent").await.expect("silent");
        let responder = h.bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = service.next().await {
                if let Some(reply) = msg.reply {
                    let _ = responder.publish(&reply, msg.payload).await;
                }
            }
        });

        h.send(r#"{"op":"cmd","target":"echo","inbox":"i-1","data":{"n":1}}"#);
        let reply = h.recv().await;
        assert_eq!(reply["op"], "reply");
        assert_eq!(reply["target"], "echo");
        assert_eq!(reply["inbox"], "i-1");
        assert_eq!(reply["data"], json!({"n": 1}));

        h.send(r#"{"op":"cmd","target":"nobody","inbox":"i-2"}"#);
        let reply = h.recv().await;
        assert_eq!(reply["inbox"], "i-2");
        assert_eq!(reply["data"]["error"], "no responders");

        h.send(r#"{"op":"cmd","target":"silent","inbox":"i-3"}"#);
        let reply = h.recv().await;
        assert_eq!(reply["op"], "reply");
        assert_eq!(reply["inbox"], "i-3");
        assert_eq!(reply["data"]["error"], "timeout");
        h.expect_quiet().await;
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn js_sub_requires_filter_and_delivers_stream_messages() {
        let caps = grants(|caps| {
            caps.streams
                .insert("ORDERS".to_string(), vec!["orders.eu.*".to_string()]);
        });
        let mut h = Harness::start("alice", Some(caps)).await;
        h.bus.create_stream("ORDERS", &["orders.>"]).expect("stream");
        h.publish("orders.eu.paris", r#"{"id":1}"#).await;
        h.publish("orders.us.nyc", r#"{"id":2}"#).await;

        h.send(r#"{"op":"js_sub","target":"ORDERS","data":{"start_seq":1}}"#);
        assert_eq!(h.recv().await["data"]["reason"], "js_sub requires a filter");
        assert_eq!(h.bus.open_handles(), 1);

        h.send(r#"{"op":"js_sub","target":"ORDERS","data":{"filter":"orders.us.*"}}"#);
        h.expect_quiet().await;
        assert_eq!(h.bus.open_handles(), 1);

        h.send(r#"{"op":"js_sub","target":"ORDERS","data":{"start_seq":1,"filter":"orders.eu.*"}}"#);
        let frame = h.recv().await;
        assert_eq!(frame["op"], "msg");
        assert_eq!(frame["target"], "ORDERS");
        assert_eq!(frame["data"]["seq"], 1);
        assert_eq!(frame["data"]["subject"], "orders.eu.paris");
        assert_eq!(frame["data"]["data"], json!({"id": 1}));
        h.expect_quiet().await;

        h.store
            .put("alice", &CapabilitySet::deny_all())
            .await
            .expect("revoke");
        assert_eq!(h.recv().await["op"], "cap_update");
        assert_eq!(h.bus.open_handles(), 1);
        h.publish("orders.eu.lyon", "{}").await;
        h.expect_quiet().await;
        let (_, bus) = h.close().await;
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wider_wildcard_target_than_granted_is_denied() {
        let caps = grants(|caps| caps.subjects = vec!["news.*".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;

        h.send(r#"{"op":"sub","target":"news.>"}"#);
        h.send(r#"{"op":"sub","target":">"}"#);
        h.expect_quiet().await;
        assert_eq!(h.bus.open_handles(), 1);
        h.publish("news.secret.deep.path", r#"{"leak":true}"#).await;
        h.expect_quiet().await;

        h.send(r#"{"op":"sub","target":"news.*"}"#);
        h.wait_for_handles(2).await;
        h.publish("news.secret.deep.path", "deep").await;
        h.publish("news.weather", "shallow").await;
        let frame = h.recv().await;
        assert_eq!(frame["target"], "news.*");
        assert_eq!(frame["data"], "shallow");
        h.expect_quiet().await;

        let (_, bus) = h.close().await;
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kv_watch_is_revoked_when_key_grant_narrows() {
        let caps = grants(|caps| {
            caps.buckets
                .insert("cfg.*".to_string(), vec!["region.>".to_string()]);
        });
        let mut h = Harness::start("alice", Some(caps)).await;
        h.bus.create_bucket("cfg.prod").expect("bucket");

        h.send(r#"{"op":"kv_sub","target":"cfg.prod","data":{"pattern":"region.us"}}"#);
        h.wait_for_handles(2).await;
        h.bus.kv_put("cfg.prod", "region.us", b"on".to_vec()).await.expect("put");
        assert_eq!(h.recv().await["data"]["value"], "on");

        let narrowed = grants(|caps| {
            caps.buckets
                .insert("cfg.*".to_string(), vec!["secrets.>".to_string()]);
        });
        h.store.put("alice", &narrowed).await.expect("narrow");
        let update = h.recv().await;
        assert_eq!(update["op"], "cap_update");
        assert_eq!(update["data"]["buckets"]["cfg.*"], json!(["secrets.>"]));
        assert_eq!(h.bus.open_handles(), 1);

        h.bus.kv_put("cfg.prod", "region.us", b"off".to_vec()).await.expect("put");
        h.expect_quiet().await;
        let (_, bus) = h.close().await;
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_commands_pair_replies_with_their_inbox() {
        let caps = grants(|caps| caps.commands = vec!["calc".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;

        // The first request is answered last.
        let mut service = h.bus.subscribe("calc").await.expect("responder");
        let responder = h.bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = service.next().await {
                let Some(reply) = msg.reply else { continue };
                let payload = msg.payload;
                let responder = responder.clone();
                tokio::spawn(async move {
                    let request: Value = serde_json::from_slice(&payload).expect("json request");
                    let n = request["n"].as_u64().expect("n");
                    if n == 1 {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                    }
                    let answer = json!({"n": n, "square": n * n}).to_string();
                    let _ = responder.publish(&reply, answer.into_bytes()).await;
                });
            }
        });

        h.send(r#"{"op":"cmd","target":"calc","inbox":"i-1","data":{"n":1}}"#);
        h.send(r#"{"op":"cmd","target":"forbidden","inbox":"i-denied","data":{"n":9}}"#);
        h.send(r#"{"op":"cmd","target":"calc","inbox":"i-2","data":{"n":2}}"#);
        h.send(r#"{"op":"cmd","target":"calc","inbox":"i-3","data":{"n":3}}"#);

        let mut order = Vec::new();
        for _ in 0..3 {
            let reply = h.recv().await;
            assert_eq!(reply["op"], "reply");
            assert_eq!(reply["target"], "calc");
            let inbox = reply["inbox"].as_str().expect("inbox").to_string();
            let n = reply["data"]["n"].as_u64().expect("n");
            assert_eq!(inbox, format!("i-{n}"));
            assert_eq!(reply["data"]["square"], n * n);
            order.push(inbox);
        }
        assert_eq!(order.last().map(String::as_str), Some("i-1"));
        order.sort();
        assert_eq!(order, vec!["i-1", "i-2", "i-3"]);
        h.expect_quiet().await;
        h.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_client_is_closed_for_backpressure() {
        let caps = grants(|caps| caps.subjects = vec!["flood".to_string()]);
        let config = SessionConfig {
            queue_capacity: 2,
            enqueue_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(100),
            ..test_config()
        };
        // The client never reads, so the writer stalls on a full sink.
        let h = Harness::start_with("alice", Some(caps), config, 0).await;
        h.send(r#"{"op":"sub","target":"flood"}"#);
        h.wait_for_handles(2).await;

        for n in 0..20 {
            h.publish("flood", &n.to_string()).await;
        }
        let reason = tokio::time::timeout(WAIT, h.session)
            .await
            .expect("closed within bound")
            .expect("join");
        assert!(
            matches!(reason, CloseReason::Backpressure | CloseReason::WriteFailed),
            "unexpected reason {reason:?}"
        );
        assert_eq!(h.bus.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_from_above_is_a_shutdown() {
        let caps = grants(|caps| caps.subjects = vec!["a".to_string()]);
        let mut h = Harness::start("alice", Some(caps)).await;
        h.send(r#"{"op":"sub","target":"a"}"#);
        h.wait_for_handles(2).await;

        h.cancel.cancel();
        let notice = h.recv().await;
        assert_eq!(notice["data"]["reason"], "server shutting down");
        let reason = tokio::time::timeout(WAIT, h.session)
            .await
            .expect("bounded")
            .expect("join");
        assert_eq!(reason, CloseReason::Shutdown);
        assert_eq!(h.bus.open_handles(), 0);
    }

    #[test]
    fn stream_frames_carry_sequence_and_subject() {
        let frame = render_stream(
            "ORDERS",
            StreamMessage {
                stream: "ORDERS".to_string(),
                subject: "orders.eu.1".to_string(),
                sequence: 9,
                payload: b"plain".to_vec(),
            },
        );
        assert_eq!(frame.op, ServerOp::Msg);
        assert_eq!(
            frame.data,
            Some(json!({"seq": 9, "subject": "orders.eu.1", "data": "plain"}))
        );
    }
}
