use crate::auth_store::CapabilityStore;
use crate::bus::Bus;
use crate::config::Config;
use crate::lifecycle::CloseReason;
use crate::session::{run_session, SessionParams};
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures_util::{Sink, Stream};
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub struct HubState {
    pub config: Config,
    pub bus: Arc<dyn Bus>,
    pub store: CapabilityStore,
    conn_counter: AtomicU64,
    active_sessions: AtomicUsize,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub active_sessions: usize,
    pub started_at: String,
}

impl HubState {
    pub fn new(config: Config, bus: Arc<dyn Bus>) -> Self {
        let store = CapabilityStore::new(
            bus.clone(),
            config.auth_bucket.clone(),
            config.anonymous_key.clone(),
        );
        Self {
            config,
            bus,
            store,
            conn_counter: AtomicU64::new(0),
            active_sessions: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            started_at: Utc::now(),
        }
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: if self.shutdown.is_cancelled() {
                "shutting_down"
            } else {
                "ok"
            },
            active_sessions: self.active_sessions(),
            started_at: self.started_at.to_rfc3339(),
        }
    }

    /// Runs one connection to completion under the hub's shutdown scope.
    pub async fn serve_connection<R, W, E>(self: Arc<Self>, identity: String, reader: R, writer: W) -> CloseReason
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display + Send,
    {
        let conn_id = self.next_conn_id();
        let params = SessionParams {
            conn_id,
            identity,
            bus: self.bus.clone(),
            store: self.store.clone(),
            config: self.config.session,
            cancel: self.shutdown.child_token(),
        };
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        let reason = self
            .sessions
            .track_future(run_session(params, reader, writer))
            .await;
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        reason
    }

    /// Cancels every session and waits, bounded, for their teardown.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.sessions.close();
        let pending = self.active_sessions();
        info!(event = "hub_shutdown", active_sessions = pending);
        if tokio::time::timeout(grace, self.sessions.wait()).await.is_err() {
            warn!(event = "hub_shutdown_timeout", active_sessions = self.active_sessions());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::memory_bus::MemoryBus;
    use futures::StreamExt;

    fn config() -> Config {
        Config {
            addr: "127.0.0.1:0".to_string(),
            debug: false,
            log_dir: String::new(),
            subprotocol: "capgate.v1".to_string(),
            allowed_origins: Vec::new(),
            dev_identity: false,
            identity_header: None,
            auth_bucket: "auth.users".to_string(),
            anonymous_key: "anonymous".to_string(),
            auth_seed: None,
            clock_subject: None,
            buckets: Vec::new(),
            streams: Vec::new(),
            shutdown_grace: Duration::from_secs(1),
            session: SessionConfig {
                ping_interval: None,
                ..SessionConfig::default()
            },
        }
    }

    #[test]
    fn conn_ids_are_sequential() {
        let hub = HubState::new(config(), Arc::new(MemoryBus::new()));
        assert_eq!(hub.next_conn_id(), "conn-1");
        assert_eq!(hub.next_conn_id(), "conn-2");
        assert_eq!(hub.health().status, "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_tears_down_open_sessions() {
        let bus = MemoryBus::new();
        bus.create_bucket("auth.users").expect("bucket");
        let hub = Arc::new(HubState::new(config(), Arc::new(bus.clone())));

        let (_to_server, reader) =
            futures::channel::mpsc::unbounded::<Result<Message, std::io::Error>>();
        let (writer, mut from_server) = futures::channel::mpsc::channel::<Message>(16);
        let session = tokio::spawn(hub.clone().serve_connection("alice".to_string(), reader, writer));

        for _ in 0..50 {
            if hub.active_sessions() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.active_sessions(), 1);

        hub.shutdown(Duration::from_secs(2)).await;
        assert_eq!(session.await.expect("join"), CloseReason::Shutdown);
        assert_eq!(hub.active_sessions(), 0);
        assert_eq!(hub.health().status, "shutting_down");

        let mut saw_notice = false;
        while let Some(msg) = from_server.next().await {
            if let Message::Text(text) = msg {
                saw_notice |= text.contains("server shutting down");
            }
        }
        assert!(saw_notice);
        assert_eq!(bus.open_handles(), 0);
    }
}
