use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{
        header::{HOST, ORIGIN},
        HeaderMap, HeaderName, StatusCode,
    },
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use capgate_core::CapabilitySet;
use capgate_hub::{
    bus::Bus,
    config::{load_config, Config},
    hub::{HealthReport, HubState},
    identity::{
        origin_allowed, resolve_identity, trust_identity_header, AuthenticatedIdentity,
        ConnectQuery, TrustedHeader,
    },
    memory_bus::MemoryBus,
};
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "capgate-hub.log";
const CLOCK_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().map_err(anyhow::Error::msg)?;
    init_logging(&config);
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", config.addr))?;

    let bus = MemoryBus::new();
    prepare_bus(&bus, &config)?;
    let hub = Arc::new(HubState::new(config.clone(), Arc::new(bus)));
    if let Some(path) = config.auth_seed.as_deref() {
        let seeded = seed_capabilities(&hub, path).await?;
        info!(event = "auth_seeded", path = %path, identities = seeded);
    }
    if let Some(subject) = config.clock_subject.clone() {
        tokio::spawn(run_clock(hub.bus.clone(), subject, hub.shutdown_token()));
    }

    let trusted = config
        .identity_header
        .as_deref()
        .map(|name| HeaderName::from_bytes(name.as_bytes()))
        .transpose()
        .context("invalid --identity-header")?;

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(from_fn_with_state(TrustedHeader(trusted), trust_identity_header))
        .with_state(hub.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!(
        event = "hub_start",
        addr = %addr,
        subprotocol = %config.subprotocol,
        dev_identity = config.dev_identity
    );

    let shutdown_hub = hub.clone();
    let grace = config.shutdown_grace;
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_hub.shutdown(grace).await;
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("hub_error")?;
    info!(event = "hub_stop");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    authenticated: Option<Extension<AuthenticatedIdentity>>,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
    let host = headers.get(HOST).and_then(|value| value.to_str().ok());
    if !origin_allowed(origin, host, &hub.config.allowed_origins) {
        warn!(event = "origin_rejected", remote = %remote, origin = origin.unwrap_or_default());
        return StatusCode::FORBIDDEN.into_response();
    }
    let identity = resolve_identity(
        authenticated.as_ref().map(|Extension(identity)| identity),
        query.user.as_deref(),
        hub.config.dev_identity,
    );
    // Oversized frames are rejected by the codec with an error frame, so the
    // transport limit only needs to stop runaway messages.
    let max_message = hub
        .config
        .session
        .max_frame_bytes
        .saturating_mul(4)
        .max(1 << 20);

    ws.protocols([hub.config.subprotocol.clone()])
        .max_message_size(max_message)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let reason = hub.serve_connection(identity, stream, sink).await;
            debug!(event = "connection_done", remote = %remote, reason = reason.as_str());
        })
}

async fn health(State(hub): State<Arc<HubState>>) -> Json<HealthReport> {
    Json(hub.health())
}

fn prepare_bus(bus: &MemoryBus, config: &Config) -> anyhow::Result<()> {
    bus.create_bucket(&config.auth_bucket)
        .with_context(|| format!("auth bucket {}", config.auth_bucket))?;
    for bucket in &config.buckets {
        bus.create_bucket(bucket)
            .with_context(|| format!("bucket {bucket}"))?;
    }
    for stream in &config.streams {
        let subjects = stream.subjects.iter().map(String::as_str).collect::<Vec<_>>();
        bus.create_stream(&stream.name, &subjects)
            .with_context(|| format!("stream {}", stream.name))?;
    }
    Ok(())
}

async fn seed_capabilities(hub: &HubState, path: &str) -> anyhow::Result<usize> {
    let raw = std::fs::read(path).with_context(|| format!("read auth seed {path}"))?;
    let raw_entries: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&raw).with_context(|| format!("parse auth seed {path}"))?;
    let mut entries = BTreeMap::new();
    for (identity, value) in raw_entries {
        let mut caps = CapabilitySet::parse(value.to_string().as_bytes())
            .with_context(|| format!("auth seed entry {identity:?}"))?;
        let dropped = caps.retain_valid_patterns();
        if dropped > 0 {
            warn!(event = "seed_invalid_patterns", identity = %identity, dropped);
        }
        entries.insert(identity, caps);
    }
    hub.store
        .seed(&entries)
        .await
        .with_context(|| format!("store auth seed {path}"))
}

async fn run_clock(bus: Arc<dyn Bus>, subject: String, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CLOCK_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Utc::now().to_rfc3339();
        if let Err(err) = bus.publish(&subject, now.into_bytes()).await {
            warn!(event = "clock_publish_error", subject = %subject, error = %err);
        }
    }
}

type SharedLogFile = Arc<Mutex<std::fs::File>>;

/// Logs to stdout and, when a log dir is configured, to an appended file. A
/// log dir that cannot be opened is reported once the subscriber is up.
fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("CAPGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file, file_error) = match open_log_file(&config.log_dir) {
        Ok(file) => (file, None),
        Err(err) => (None, Some(err)),
    };
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    if let Some(err) = file_error {
        warn!(event = "log_file_error", log_dir = %config.log_dir, error = %err);
    }
}

struct TeeWriter {
    stdout: io::Stdout,
    file: Option<SharedLogFile>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let _ = file.lock().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<Option<SharedLogFile>> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(log_dir).join(LOG_FILE_NAME))?;
    Ok(Some(Arc::new(Mutex::new(file))))
}
