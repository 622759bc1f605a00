use crate::auth_store::{DEFAULT_ANONYMOUS_KEY, DEFAULT_AUTH_BUCKET};
use capgate_core::DEFAULT_MAX_FRAME_BYTES;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_SUBPROTOCOL: &str = "capgate.v1";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub log_dir: String,
    pub subprotocol: String,
    pub allowed_origins: Vec<String>,
    pub dev_identity: bool,
    pub identity_header: Option<String>,
    pub auth_bucket: String,
    pub anonymous_key: String,
    pub auth_seed: Option<String>,
    pub clock_subject: Option<String>,
    pub buckets: Vec<String>,
    pub streams: Vec<StreamSpec>,
    pub shutdown_grace: Duration,
    pub session: SessionConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub command_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub max_frame_bytes: usize,
    pub default_batch: usize,
    pub max_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            enqueue_timeout: Duration::from_millis(250),
            command_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            ping_interval: Some(Duration::from_secs(20)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            default_batch: 50,
            max_batch: 1000,
        }
    }
}

impl SessionConfig {
    /// Non-positive requests get the default window; large ones are capped.
    pub fn effective_batch(&self, requested: i64) -> usize {
        if requested <= 0 {
            return self.default_batch.min(self.max_batch).max(1);
        }
        (requested as u64).min(self.max_batch as u64).max(1) as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "capgate-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 250)]
    enqueue_timeout_ms: u64,
    #[arg(long, default_value_t = 5)]
    command_timeout: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 20)]
    ping_interval: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = 50)]
    default_batch: usize,
    #[arg(long, default_value_t = 1000)]
    max_batch: usize,
    #[arg(long, default_value = DEFAULT_SUBPROTOCOL)]
    subprotocol: String,
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,
    #[arg(long, default_value_t = false)]
    dev_identity: bool,
    #[arg(long, default_value = "")]
    identity_header: String,
    #[arg(long, default_value = DEFAULT_AUTH_BUCKET)]
    auth_bucket: String,
    #[arg(long, default_value = DEFAULT_ANONYMOUS_KEY)]
    anonymous_key: String,
    #[arg(long, default_value = "")]
    auth_seed: String,
    #[arg(long, default_value = "")]
    clock_subject: String,
    /// KV bucket to create on the in-process bus (repeatable).
    #[arg(long = "bucket")]
    buckets: Vec<String>,
    /// Stream to create on the in-process bus, as `NAME=subject,subject`.
    #[arg(long = "stream")]
    streams: Vec<String>,
    #[arg(long, default_value_t = 5)]
    shutdown_grace: u64,
}

pub fn load_config() -> Result<Config, String> {
    Config::from_args(Args::parse())
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, String> {
        let streams = args
            .streams
            .iter()
            .map(|raw| parse_stream_spec(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let mut allowed_origins = args.allowed_origins;
        if allowed_origins.is_empty() {
            allowed_origins = resolve_allowed_origins();
        }
        Ok(Config {
            addr: resolve_addr(&args.addr),
            debug: args.debug || env_true("CAPGATE_DEBUG"),
            log_dir: resolve_log_dir(&args.log_dir),
            subprotocol: args.subprotocol,
            allowed_origins,
            dev_identity: args.dev_identity || env_true("CAPGATE_DEV_IDENTITY"),
            identity_header: non_empty(&args.identity_header),
            auth_bucket: args.auth_bucket,
            anonymous_key: args.anonymous_key,
            auth_seed: non_empty(&args.auth_seed),
            clock_subject: non_empty(&args.clock_subject),
            buckets: args.buckets,
            streams,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            session: SessionConfig {
                queue_capacity: args.queue_capacity.max(1),
                enqueue_timeout: Duration::from_millis(args.enqueue_timeout_ms),
                command_timeout: Duration::from_secs(args.command_timeout),
                write_timeout: Duration::from_secs(args.write_timeout),
                ping_interval: (args.ping_interval > 0)
                    .then(|| Duration::from_secs(args.ping_interval)),
                max_frame_bytes: args.max_frame_bytes,
                default_batch: args.default_batch,
                max_batch: args.max_batch.max(1),
            },
        })
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_non_empty("CAPGATE_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_non_empty("CAPGATE_LOG_DIR").unwrap_or_default()
}

fn resolve_allowed_origins() -> Vec<String> {
    env_non_empty("CAPGATE_ALLOWED_ORIGINS")
        .map(|raw| parse_origins(&raw))
        .unwrap_or_default()
}

pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_stream_spec(raw: &str) -> Result<StreamSpec, String> {
    let Some((name, subjects)) = raw.split_once('=') else {
        return Err(format!("stream spec {raw:?} must look like NAME=subject,subject"));
    };
    let name = name.trim();
    let subjects = parse_origins(subjects);
    if name.is_empty() || subjects.is_empty() {
        return Err(format!("stream spec {raw:?} needs a name and at least one subject"));
    }
    Ok(StreamSpec {
        name: name.to_string(),
        subjects,
    })
}
