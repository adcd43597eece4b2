use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::application::policy::{Backoff, RetryPolicy};
use crate::application::{ConsumerConfig, ProducerConfig};
use crate::broker::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::broker::{BrokerConfig, Credentials, TlsConfig};
use crate::domain::records::Headers;
use crate::errors::{OutboxError, OutboxResult};

/// Runtime settings, built once at startup and handed to each component.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub hosts: Vec<(String, u16)>,
    pub vhost: String,
    pub username: String,
    pub passcode: String,
    /// (outgoing, incoming) heart-beat intervals in milliseconds.
    pub heartbeats: (u64, u64),
    pub use_tls: bool,
    pub tls: TlsConfig,
    pub subscribe_headers: Headers,
    pub exclusive_queue: bool,
    pub max_retry_attempts: u32,
    pub pause_for_retry: Duration,
    pub wait_retry: Duration,
    pub maximum_backoff: Duration,
    pub producer_waiting_time: Duration,
    pub published_chunk_size: usize,
    pub background_processing: bool,
    pub consumer_workers: usize,
    /// `None` waits for in-flight messages forever.
    pub shutdown_timeout: Option<Duration>,
    pub days_to_keep_data: i64,
    pub remove_data_cache_ttl: Duration,
    pub receipt_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            hosts: vec![("127.0.0.1".to_string(), 61613)],
            vhost: "/".to_string(),
            username: "guest".to_string(),
            passcode: "guest".to_string(),
            heartbeats: (10_000, 10_000),
            use_tls: false,
            tls: TlsConfig::default(),
            subscribe_headers: ConsumerConfig::default().subscribe_headers,
            exclusive_queue: false,
            max_retry_attempts: 50,
            pause_for_retry: Duration::from_secs(240),
            wait_retry: Duration::from_secs(60),
            maximum_backoff: Duration::from_secs(3600),
            producer_waiting_time: Duration::from_secs(1),
            published_chunk_size: 200,
            background_processing: false,
            consumer_workers: 1,
            shutdown_timeout: None,
            days_to_keep_data: 30,
            remove_data_cache_ttl: Duration::from_secs(86_400),
            receipt_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

fn invalid(name: &str, value: &str, why: impl std::fmt::Display) -> OutboxError {
    OutboxError::Config(format!("{}={:?}: {}", name, value, why))
}

fn parse<T>(name: &str, value: &str) -> OutboxResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(name, value, e))
}

fn parse_bool(name: &str, value: &str) -> OutboxResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "expected a boolean")),
    }
}

fn parse_secs(name: &str, value: &str) -> OutboxResult<Duration> {
    let secs: f64 = parse(name, value)?;
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(name, value, e))
}

fn parse_hosts(name: &str, value: &str) -> OutboxResult<Vec<(String, u16)>> {
    let hosts = value
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| {
            let (host, port) = h
                .rsplit_once(':')
                .ok_or_else(|| invalid(name, value, "expected host:port"))?;
            Ok((host.to_string(), parse(name, port)?))
        })
        .collect::<OutboxResult<Vec<_>>>()?;
    if hosts.is_empty() {
        return Err(invalid(name, value, "no hosts given"));
    }
    Ok(hosts)
}

fn parse_pair(name: &str, value: &str) -> OutboxResult<(u64, u64)> {
    let (a, b) = value
        .split_once(',')
        .ok_or_else(|| invalid(name, value, "expected two comma-separated values"))?;
    Ok((parse(name, a)?, parse(name, b)?))
}

/// `key=value;key=value` header list.
fn parse_headers(name: &str, value: &str) -> OutboxResult<Headers> {
    value
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| invalid(name, value, "expected key=value pairs"))
        })
        .collect()
}

impl Settings {
    /// Defaults overridden by `OUTBOX_*` variables (and `DATABASE_URL`).
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> OutboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        s.database_url = var("DATABASE_URL");
        if let Some(v) = var("OUTBOX_STOMP_HOSTS") {
            s.hosts = parse_hosts("OUTBOX_STOMP_HOSTS", &v)?;
        }
        if let Some(v) = var("OUTBOX_STOMP_VHOST") {
            s.vhost = v;
        }
        if let Some(v) = var("OUTBOX_STOMP_USERNAME") {
            s.username = v;
        }
        if let Some(v) = var("OUTBOX_STOMP_PASSCODE") {
            s.passcode = v;
        }
        if let Some(v) = var("OUTBOX_STOMP_HEARTBEATS") {
            s.heartbeats = parse_pair("OUTBOX_STOMP_HEARTBEATS", &v)?;
        }
        if let Some(v) = var("OUTBOX_STOMP_USE_SSL") {
            s.use_tls = parse_bool("OUTBOX_STOMP_USE_SSL", &v)?;
        }
        s.tls.key_file = var("OUTBOX_STOMP_KEY_FILE").map(PathBuf::from);
        s.tls.cert_file = var("OUTBOX_STOMP_CERT_FILE").map(PathBuf::from);
        s.tls.ca_certs = var("OUTBOX_STOMP_CA_CERTS").map(PathBuf::from);
        if let Some(v) = var("OUTBOX_STOMP_QUEUE_HEADERS") {
            s.subscribe_headers = parse_headers("OUTBOX_STOMP_QUEUE_HEADERS", &v)?;
        }
        if let Some(v) = var("OUTBOX_EXCLUSIVE_QUEUE") {
            s.exclusive_queue = parse_bool("OUTBOX_EXCLUSIVE_QUEUE", &v)?;
        }
        if let Some(v) = var("OUTBOX_MAXIMUM_RETRY_ATTEMPTS") {
            s.max_retry_attempts = parse("OUTBOX_MAXIMUM_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("OUTBOX_PAUSE_FOR_RETRY") {
            s.pause_for_retry = parse_secs("OUTBOX_PAUSE_FOR_RETRY", &v)?;
        }
        if let Some(v) = var("OUTBOX_WAIT_RETRY") {
            s.wait_retry = parse_secs("OUTBOX_WAIT_RETRY", &v)?;
        }
        if let Some(v) = var("OUTBOX_MAXIMUM_BACKOFF") {
            s.maximum_backoff = parse_secs("OUTBOX_MAXIMUM_BACKOFF", &v)?;
        }
        if let Some(v) = var("OUTBOX_PRODUCER_WAITING_TIME") {
            s.producer_waiting_time = parse_secs("OUTBOX_PRODUCER_WAITING_TIME", &v)?;
        }
        if let Some(v) = var("OUTBOX_PUBLISHED_CHUNK_SIZE") {
            s.published_chunk_size = parse("OUTBOX_PUBLISHED_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = var("OUTBOX_CONSUMER_PROCESS_MSG_ON_BACKGROUND") {
            s.background_processing = parse_bool("OUTBOX_CONSUMER_PROCESS_MSG_ON_BACKGROUND", &v)?;
        }
        if let Some(v) = var("OUTBOX_CONSUMER_MSG_PROCESSING_WORKERS") {
            s.consumer_workers = parse("OUTBOX_CONSUMER_MSG_PROCESSING_WORKERS", &v)?;
        }
        if let Some(v) = var("OUTBOX_CONSUMER_SHUTDOWN_TIMEOUT") {
            s.shutdown_timeout = Some(parse_secs("OUTBOX_CONSUMER_SHUTDOWN_TIMEOUT", &v)?);
        }
        if let Some(v) = var("OUTBOX_DAYS_TO_KEEP_DATA") {
            s.days_to_keep_data = parse("OUTBOX_DAYS_TO_KEEP_DATA", &v)?;
        }
        if let Some(v) = var("OUTBOX_REMOVE_DATA_CACHE_TTL") {
            s.remove_data_cache_ttl = parse_secs("OUTBOX_REMOVE_DATA_CACHE_TTL", &v)?;
        }
        if let Some(v) = var("OUTBOX_RECEIPT_TIMEOUT") {
            s.receipt_timeout = parse_secs("OUTBOX_RECEIPT_TIMEOUT", &v)?;
        }
        if let Some(v) = var("OUTBOX_STOMP_MAX_FRAME_SIZE") {
            s.max_frame_size = parse("OUTBOX_STOMP_MAX_FRAME_SIZE", &v)?;
        }
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> OutboxResult<()> {
        if self.max_retry_attempts == 0 {
            return Err(OutboxError::Config("max retry attempts must be at least 1".to_string()));
        }
        if self.published_chunk_size == 0 {
            return Err(OutboxError::Config("published chunk size must be at least 1".to_string()));
        }
        if self.consumer_workers == 0 {
            return Err(OutboxError::Config("consumer workers must be at least 1".to_string()));
        }
        if self.max_frame_size == 0 {
            return Err(OutboxError::Config("max frame size must be at least 1".to_string()));
        }
        if self.days_to_keep_data < 0 {
            return Err(OutboxError::Config("days to keep data cannot be negative".to_string()));
        }
        if self.use_tls && self.tls.ca_certs.is_none() {
            return Err(OutboxError::Config(
                "OUTBOX_STOMP_CA_CERTS is required when TLS is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> OutboxResult<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| OutboxError::Config("DATABASE_URL must be set".to_string()))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.passcode)
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            hosts: self.hosts.clone(),
            vhost: self.vhost.clone(),
            heartbeats: self.heartbeats,
            tls: self.use_tls.then(|| self.tls.clone()),
            receipt_timeout: self.receipt_timeout,
            max_frame_size: self.max_frame_size,
            ..BrokerConfig::default()
        }
    }

    pub fn producer(&self) -> ProducerConfig {
        ProducerConfig {
            retry: RetryPolicy {
                max_attempts: self.max_retry_attempts,
                pause_for_retry: self.pause_for_retry,
                wait_retry: self.wait_retry,
            },
            backoff: Backoff::new(self.maximum_backoff),
            waiting_time: self.producer_waiting_time,
            chunk_size: self.published_chunk_size,
            days_to_keep: self.days_to_keep_data,
            prune_ttl: self.remove_data_cache_ttl,
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            subscribe_headers: self.subscribe_headers.clone(),
            exclusive: self.exclusive_queue,
            background_processing: self.background_processing,
            workers: self.consumer_workers,
            backoff: Backoff::new(self.maximum_backoff),
            days_to_keep: self.days_to_keep_data,
            prune_ttl: self.remove_data_cache_ttl,
        }
    }
}
