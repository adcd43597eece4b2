use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use super::connector::Connector;
use super::headers;
use super::listeners::ProducerListener;
use super::policy::{retention_cutoff, sleep_unless, Backoff, IdleBackoff, PruneGate, RetryPolicy};
use crate::broker::{Connection, Credentials};
use crate::domain::errors::StoreError;
use crate::domain::ports::OutboxStore;
use crate::domain::records::{Headers, OutboxRecord, Status};
use crate::errors::{OutboxError, OutboxResult};

/// How far a record that exhausted its send attempts is pushed out, so the
/// next sweep does not pick it straight up again.
const FAILED_EXPIRY_DAYS: i64 = 15;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub retry: RetryPolicy,
    pub backoff: Backoff,
    /// Base pause between polls of the outbox.
    pub waiting_time: Duration,
    pub chunk_size: usize,
    pub days_to_keep: i64,
    pub prune_ttl: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            backoff: Backoff::default(),
            waiting_time: Duration::from_secs(1),
            chunk_size: 200,
            days_to_keep: 30,
            prune_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Delivers outbox records to the broker.
pub struct Producer {
    connector: Connector,
    store: Arc<dyn OutboxStore>,
    config: ProducerConfig,
    listener_name: String,
    prune: PruneGate,
    idle: IdleBackoff,
    empty_polls: AtomicU32,
    shutdown: AtomicBool,
}

impl Producer {
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Credentials,
        store: Arc<dyn OutboxStore>,
        config: ProducerConfig,
    ) -> Self {
        let listener_name = format!("producer-listener-{}", Uuid::new_v4());
        connection.set_listener(&listener_name, Arc::new(ProducerListener));
        Self {
            connector: Connector::new(connection, credentials, config.backoff),
            store,
            prune: PruneGate::new(config.prune_ttl),
            idle: IdleBackoff {
                base: config.waiting_time,
            },
            config,
            listener_name,
            empty_polls: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn listener_name(&self) -> &str {
        &self.listener_name
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Connect unless already connected. Blocks until the broker answers or
    /// a shutdown is requested.
    pub fn start(&self) -> OutboxResult<()> {
        self.connector.connect("Producer", &self.shutdown)?;
        Ok(())
    }

    pub fn stop(&self) {
        if !self.connector.is_connected() {
            info!("Producer not started");
            return;
        }
        if let Err(e) = self.connector.connection().disconnect() {
            error!("Error disconnecting producer: {}", e);
        }
    }

    /// Start now and stop when the returned guard goes out of scope.
    pub fn session(&self) -> OutboxResult<ProducerGuard<'_>> {
        self.start()?;
        Ok(ProducerGuard { producer: self })
    }

    /// Ask `run` to return after the current batch.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Send one outbox record. Default headers are merged under the
    /// record's own and stored back on it. Returns the failed attempts
    /// that preceded the successful one.
    pub fn send(&self, record: &mut OutboxRecord) -> OutboxResult<u32> {
        let body = serde_json::to_string(&record.body)?;
        record.headers = headers::merge(headers::default_headers(record, Utc::now()), &record.headers);
        self.send_with_retry(&record.destination, &body, &record.headers)
    }

    /// Send a payload that has no outbox record behind it.
    pub fn send_event(&self, body: &Value, destination: &str, headers: &Headers) -> OutboxResult<u32> {
        let body = serde_json::to_string(body)?;
        self.send_with_retry(destination, &body, headers)
    }

    /// Each attempt reconnects first if the broker dropped the connection.
    /// A shutdown request ends the retries after the current attempt.
    fn send_with_retry(&self, destination: &str, body: &str, headers: &Headers) -> OutboxResult<u32> {
        let connection = self.connector.connection();
        let result = self.config.retry.run_until(&self.shutdown, || {
            self.connector.connect("Producer", &self.shutdown)?;
            connection.send(destination, body, headers)
        });
        self.remove_old_messages();
        result
    }

    fn remove_old_messages(&self) {
        let cutoff = retention_cutoff(Utc::now(), self.config.days_to_keep);
        self.prune
            .run("published", || self.store.delete_added_before(cutoff));
    }

    /// Send one chunk of due records. Returns how many were handled.
    ///
    /// The broker connection is opened before any record is locked, so an
    /// outage never holds rows while the connect loop backs off.
    pub fn publish_message_from_database(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        if !self.store.has_due(now)? {
            return Ok(0);
        }
        if let Err(e) = self.start() {
            debug!("Leaving due messages scheduled: {}", e);
            return Ok(0);
        }
        self.store
            .process_due(now, self.config.chunk_size, &mut |record| {
                debug!("Message to publish with body: {}", record.body);
                self.publish_record(record);
            })
    }

    fn publish_record(&self, record: &mut OutboxRecord) {
        match self.send(record) {
            Ok(attempts) => {
                record.retry = attempts as i32;
                record.status = Status::Succeeded;
                info!("Message published with id: {}", record.id);
            }
            Err(OutboxError::Transport(e)) if self.is_shutdown_requested() => {
                info!("Shutting down, message {} stays scheduled: {}", record.id, e);
            }
            Err(e) => {
                if let OutboxError::ExceededSendAttempts { attempts } = e {
                    record.retry = attempts as i32;
                }
                error!("Message not published with id {}: {}", record.id, e);
                record.status = Status::Failed;
                record.expires_at = Utc::now() + chrono::Duration::days(FAILED_EXPIRY_DAYS);
            }
        }
    }

    /// Poll the outbox until [`Producer::request_shutdown`] is called.
    ///
    /// Store failures are logged and waited out; they never end the loop.
    pub fn run(&self) {
        info!("Starting publisher");
        while !self.is_shutdown_requested() {
            let wait = match self.publish_message_from_database() {
                Ok(0) => {
                    let empty = self.empty_polls.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("No objects to publish");
                    self.idle.wait_for(empty)
                }
                Ok(handled) => {
                    self.empty_polls.store(0, Ordering::SeqCst);
                    debug!("Handled {} outbox records", handled);
                    self.idle.base
                }
                Err(e) => {
                    warn!("Outbox store unavailable, retrying: {}", e);
                    self.config.waiting_time
                }
            };
            sleep_unless(&self.shutdown, wait);
        }
        self.stop();
        info!("Publisher stopped");
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.connector
            .connection()
            .remove_listener(&self.listener_name);
    }
}

/// Keeps a producer connected for a scope.
pub struct ProducerGuard<'a> {
    producer: &'a Producer,
}

impl Deref for ProducerGuard<'_> {
    type Target = Producer;

    fn deref(&self) -> &Producer {
        self.producer
    }
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        self.producer.stop();
    }
}
