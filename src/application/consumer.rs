use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use super::connector::Connector;
use super::context::MessageContext;
use super::listeners::ConsumerListener;
use super::payload::Payload;
use super::policy::{retention_cutoff, Backoff, PruneGate};
use super::pool::{Job, WorkerPool};
use super::registry::Callback;
use crate::broker::{AckMode, Connection, Credentials, Frame};
use crate::domain::ports::InboxStore;
use crate::domain::records::Headers;
use crate::errors::{OutboxError, OutboxResult};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Extra SUBSCRIBE headers (durability, prefetch and the like).
    pub subscribe_headers: Headers,
    pub exclusive: bool,
    /// Run callbacks on a worker pool instead of the connection's I/O thread.
    pub background_processing: bool,
    pub workers: usize,
    pub backoff: Backoff,
    pub days_to_keep: i64,
    pub prune_ttl: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            subscribe_headers: Headers::from([
                ("durable".to_string(), "true".to_string()),
                ("auto-delete".to_string(), "false".to_string()),
                ("prefetch-count".to_string(), "1".to_string()),
            ]),
            exclusive: false,
            background_processing: false,
            workers: 1,
            backoff: Backoff::default(),
            days_to_keep: 30,
            prune_ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Already in the inbox; acked without running the callback.
    Duplicate,
    Acked,
    Nacked,
    /// The callback settled nothing, or settling failed. The broker will
    /// redeliver.
    Unacknowledged,
    /// Not processed because the consumer is shutting down.
    Dropped,
}

struct Subscription {
    state: SubscriptionState,
    callback: Option<Callback>,
    destination: Option<String>,
    queue_name: Option<String>,
    subscribe_id: Option<String>,
}

/// Count of messages between delivery and the end of their handler.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
        InFlightGuard(Arc::clone(self))
    }

    /// Wait until nothing is in flight. Returns `false` on timeout.
    fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let Ok(count) = self.count.lock() else {
            return false;
        };
        match timeout {
            Some(timeout) => self
                .idle
                .wait_timeout_while(count, timeout, |n| *n > 0)
                .map(|(_, result)| !result.timed_out())
                .unwrap_or(false),
            None => self.idle.wait_while(count, |n| *n > 0).is_ok(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut count) = self.0.count.lock() {
            *count = count.saturating_sub(1);
        }
        self.0.idle.notify_all();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

pub(crate) struct ConsumerInner {
    connector: Connector,
    inbox: Arc<dyn InboxStore>,
    config: ConsumerConfig,
    listener_name: String,
    subscription: Mutex<Subscription>,
    shutdown: AtomicBool,
    stopping: AtomicBool,
    in_flight: Arc<InFlight>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    prune: PruneGate,
    me: Weak<ConsumerInner>,
}

/// Subscribes to one destination and feeds each message through the
/// deduplicating inbox pipeline.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Credentials,
        inbox: Arc<dyn InboxStore>,
        config: ConsumerConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| ConsumerInner {
            connector: Connector::new(connection, credentials, config.backoff),
            inbox,
            listener_name: format!("consumer-listener-{}", Uuid::new_v4()),
            subscription: Mutex::new(Subscription {
                state: SubscriptionState::Unsubscribed,
                callback: None,
                destination: None,
                queue_name: None,
                subscribe_id: None,
            }),
            shutdown: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
            pool: Mutex::new(None),
            prune: PruneGate::new(config.prune_ttl),
            config,
            me: me.clone(),
        });
        Self { inner }
    }

    /// Connect, declare the dead-letter queue and subscribe `callback` to
    /// `destination`. Calling it again keeps the current subscription id.
    pub fn start(
        &self,
        callback: Callback,
        destination: &str,
        queue_name: Option<&str>,
    ) -> OutboxResult<()> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(OutboxError::Config(
                "cannot start a consumer while it is stopping".to_string(),
            ));
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        {
            let mut sub = self.inner.subscription()?;
            sub.callback = Some(callback);
            sub.destination = Some(destination.to_string());
            sub.queue_name = queue_name.map(str::to_string);
        }
        self.inner.subscribe()
    }

    /// Drain and disconnect.
    ///
    /// New deliveries are left unacknowledged from now on. In-flight
    /// messages get up to `timeout` (forever when `None`) to finish; the
    /// subscription is cancelled and the connection closed either way.
    /// Returns `false` when the drain timed out.
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::SeqCst) {
            info!("Consumer shutdown already in progress");
            return false;
        }
        inner.shutdown.store(true, Ordering::SeqCst);
        info!("Stopping consumer");

        let drained = inner.in_flight.wait_idle(timeout);
        if !drained {
            warn!(
                "In-flight messages still running after {:?}; they may be redelivered",
                timeout.unwrap_or_default()
            );
        }
        let pool = inner.pool.lock().ok().and_then(|mut pool| pool.take());
        if let Some(pool) = pool {
            pool.shutdown(drained);
        }

        let subscribe_id = match inner.subscription() {
            Ok(mut sub) => {
                sub.state = SubscriptionState::Unsubscribing;
                sub.subscribe_id.take()
            }
            Err(_) => None,
        };
        let connection = inner.connector.connection();
        connection.remove_listener(&inner.listener_name);
        match subscribe_id {
            Some(id) if connection.is_connected() => {
                match connection.unsubscribe(&id) {
                    Ok(()) => info!("Subscription with id {} canceled", id),
                    Err(e) => warn!("Could not cancel subscription {}: {}", id, e),
                }
                if let Err(e) = connection.disconnect() {
                    error!("Error disconnecting consumer: {}", e);
                }
            }
            _ => info!("Consumer not started"),
        }

        if let Ok(mut sub) = inner.subscription() {
            sub.state = SubscriptionState::Unsubscribed;
        }
        inner.stopping.store(false, Ordering::SeqCst);
        drained
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connector.is_connected()
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner
            .subscription()
            .map(|s| s.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub fn subscribe_id(&self) -> Option<String> {
        self.inner
            .subscription()
            .ok()
            .and_then(|s| s.subscribe_id.clone())
    }

    /// Run the inbox pipeline for one message body and its headers.
    pub fn message_handler(&self, body: &str, headers: &Headers) -> HandleOutcome {
        self.inner.message_handler(body, headers)
    }
}

impl ConsumerInner {
    fn subscription(&self) -> OutboxResult<MutexGuard<'_, Subscription>> {
        self.subscription
            .lock()
            .map_err(|_| OutboxError::Config("consumer state lock poisoned".to_string()))
    }

    pub(crate) fn is_current_subscription(&self, id: &str) -> bool {
        self.subscription()
            .map(|s| s.subscribe_id.as_deref() == Some(id))
            .unwrap_or(false)
    }

    fn subscribe(&self) -> OutboxResult<()> {
        let connection = Arc::clone(self.connector.connection());
        connection.set_listener(
            &self.listener_name,
            Arc::new(ConsumerListener {
                consumer: self.me.clone(),
            }),
        );
        self.connector.connect("Consumer", &self.shutdown)?;

        let (destination, queue_name, existing_id) = {
            let mut sub = self.subscription()?;
            sub.state = SubscriptionState::Subscribing;
            let destination = sub
                .destination
                .clone()
                .ok_or_else(|| OutboxError::Config("consumer has no destination".to_string()))?;
            (destination, sub.queue_name.clone(), sub.subscribe_id.clone())
        };
        let queue_name = queue_name.unwrap_or_else(|| routing_key(&destination).to_string());

        let result = self.declare_and_subscribe(&destination, &queue_name, existing_id);
        if let Ok(mut sub) = self.subscription() {
            sub.state = match result {
                Ok(()) => SubscriptionState::Subscribed,
                Err(_) => SubscriptionState::Unsubscribed,
            };
        }
        result
    }

    fn declare_and_subscribe(
        &self,
        destination: &str,
        queue_name: &str,
        existing_id: Option<String>,
    ) -> OutboxResult<()> {
        let connection = self.connector.connection();
        let id = match existing_id {
            Some(id) => id,
            None => {
                self.create_dlq_queue(queue_name)?;
                let id = Uuid::new_v4().to_string();
                self.subscription()?.subscribe_id = Some(id.clone());
                id
            }
        };
        let headers = self.subscribe_headers(queue_name, format!("DLQ.{}", queue_name));
        connection.subscribe(destination, &id, AckMode::Client, &headers)?;
        info!("Created queue {} with id: {}", queue_name, id);
        info!("Consumer started with id: {}", id);
        Ok(())
    }

    /// Subscribe to the dead-letter queue and drop the subscription straight
    /// away; the broker keeps the queue.
    fn create_dlq_queue(&self, queue_name: &str) -> OutboxResult<()> {
        let connection = self.connector.connection();
        let dlq_name = format!("DLQ.{}", queue_name);
        let id = Uuid::new_v4().to_string();
        let headers = self.subscribe_headers(&dlq_name, format!("DLQ.DLQ.{}", queue_name));
        connection.subscribe(&format!("/queue/{}", dlq_name), &id, AckMode::Client, &headers)?;
        connection.unsubscribe(&id)?;
        info!("Created queue {} with id: {}", dlq_name, id);
        Ok(())
    }

    fn subscribe_headers(&self, queue_name: &str, dead_letter_key: String) -> Headers {
        let mut headers = self.config.subscribe_headers.clone();
        headers.insert("exclusive".to_string(), self.config.exclusive.to_string());
        headers.insert("x-queue-name".to_string(), queue_name.to_string());
        headers.insert("x-dead-letter-routing-key".to_string(), dead_letter_key);
        headers.insert("x-dead-letter-exchange".to_string(), String::new());
        headers
    }

    /// Resubscribe after the broker dropped the connection.
    pub(crate) fn reconnect(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            debug!("Shutdown requested, not reconnecting");
            return;
        }
        let started = self
            .subscription()
            .map(|s| s.callback.is_some())
            .unwrap_or(false);
        if !started {
            return;
        }
        if let Err(e) = self.subscribe() {
            error!("Consumer could not resubscribe: {}", e);
        }
    }

    /// Process a frame inline or hand it to the worker pool. Returns the
    /// outcome when it is already known.
    pub(crate) fn dispatch(&self, frame: Frame) -> Option<HandleOutcome> {
        if self.shutdown.load(Ordering::SeqCst) {
            warn!(
                "Shutdown in progress, leaving message {} unacknowledged",
                frame.header("message-id").unwrap_or("<none>")
            );
            return Some(HandleOutcome::Dropped);
        }
        let guard = self.in_flight.enter();
        if !self.config.background_processing {
            let outcome = self.handle_frame(&frame);
            drop(guard);
            return Some(outcome);
        }

        let me = self.me.clone();
        let job: Job = Box::new(move || {
            let _guard = guard;
            if let Some(consumer) = me.upgrade() {
                consumer.handle_frame(&frame);
            }
        });
        self.submit(job)
    }

    fn submit(&self, job: Job) -> Option<HandleOutcome> {
        let Ok(mut slot) = self.pool.lock() else {
            error!("Worker pool lock poisoned, message left unacknowledged");
            return Some(HandleOutcome::Dropped);
        };
        let pool = slot
            .get_or_insert_with(|| Arc::new(WorkerPool::new("consumer", self.config.workers)))
            .clone();
        let job = match pool.submit(job) {
            Ok(()) => return None,
            Err(job) => job,
        };
        if self.shutdown.load(Ordering::SeqCst) {
            warn!("Worker pool shut down during shutdown, message left unacknowledged");
            return Some(HandleOutcome::Dropped);
        }
        info!("Worker pool was shut down, starting a new one");
        let fresh = Arc::new(WorkerPool::new("consumer", self.config.workers));
        *slot = Some(Arc::clone(&fresh));
        match fresh.submit(job) {
            Ok(()) => None,
            Err(_) => {
                error!("Fresh worker pool rejected the message, left unacknowledged");
                Some(HandleOutcome::Dropped)
            }
        }
    }

    fn handle_frame(&self, frame: &Frame) -> HandleOutcome {
        self.message_handler(&frame.body_text(), &frame.headers_map())
    }

    fn message_handler(&self, raw_body: &str, headers: &Headers) -> HandleOutcome {
        let ctx = MessageContext::from_headers(headers);
        let outcome = self.process(raw_body, headers, &ctx);
        let cutoff = retention_cutoff(Utc::now(), self.config.days_to_keep);
        self.prune
            .run("received", || self.inbox.delete_added_before(cutoff));
        debug!("{} Message handled: {:?}", ctx, outcome);
        outcome
    }

    fn process(&self, raw_body: &str, headers: &Headers, ctx: &MessageContext) -> HandleOutcome {
        let body = serde_json::from_str::<Value>(raw_body).unwrap_or_else(|e| {
            warn!("{} Message body is not valid JSON, passing it through raw: {}", ctx, e);
            Value::String(raw_body.to_string())
        });
        let Some(callback) = self.subscription().ok().and_then(|s| s.callback.clone()) else {
            warn!("{} No callback registered, message left unacknowledged", ctx);
            return HandleOutcome::Unacknowledged;
        };
        let mut payload = Payload::new(
            Arc::clone(self.connector.connection()),
            body,
            headers.clone(),
            ctx.clone(),
        );

        if let Some(msg_id) = ctx.msg_id.as_deref() {
            match self.inbox.exists(msg_id) {
                Ok(true) => {
                    info!(
                        "{} Message with msg_id: {} already exists. discarding the message",
                        ctx, msg_id
                    );
                    return match payload.ack() {
                        Ok(()) => HandleOutcome::Duplicate,
                        Err(e) => {
                            error!("{} Could not ack duplicate message: {}", ctx, e);
                            HandleOutcome::Unacknowledged
                        }
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    error!("{} Could not check msg_id {}: {}", ctx, msg_id, e);
                    return HandleOutcome::Unacknowledged;
                }
            }
        }

        match panic::catch_unwind(AssertUnwindSafe(|| callback(&mut payload))) {
            Ok(Ok(())) => self.finish(&mut payload, ctx),
            Ok(Err(e)) => {
                error!("{} An error was raised during callback processing: {:#}", ctx, e);
                self.reject(&mut payload, ctx)
            }
            Err(panic) => {
                error!(
                    "{} Callback panicked during processing: {}",
                    ctx,
                    panic_message(panic.as_ref())
                );
                self.reject(&mut payload, ctx)
            }
        }
    }

    fn finish(&self, payload: &mut Payload, ctx: &MessageContext) -> HandleOutcome {
        if payload.nacked() {
            return HandleOutcome::Nacked;
        }
        if payload.saved() {
            let outcome = match self.inbox.insert_if_absent(&payload.message) {
                Ok(true) => HandleOutcome::Acked,
                Ok(false) => {
                    info!(
                        "{} Message with msg_id: {:?} was stored concurrently",
                        ctx,
                        payload.msg_id()
                    );
                    HandleOutcome::Duplicate
                }
                Err(e) => {
                    error!("{} Could not store the received message: {}", ctx, e);
                    return self.reject(payload, ctx);
                }
            };
            return match payload.ack() {
                Ok(()) => outcome,
                Err(e) => {
                    error!("{} Could not ack message: {}", ctx, e);
                    HandleOutcome::Unacknowledged
                }
            };
        }
        if payload.acked() {
            return HandleOutcome::Acked;
        }
        warn!(
            "{} The save or nack command was not executed, and the routine finished running \
             without receiving an acknowledgement or a negative acknowledgement. message-id: {}",
            ctx,
            payload.msg_id().unwrap_or("<none>")
        );
        HandleOutcome::Unacknowledged
    }

    fn reject(&self, payload: &mut Payload, ctx: &MessageContext) -> HandleOutcome {
        if payload.acked() {
            return HandleOutcome::Acked;
        }
        match payload.nack() {
            Ok(()) => HandleOutcome::Nacked,
            Err(e) => {
                error!("{} Could not nack message: {}", ctx, e);
                HandleOutcome::Unacknowledged
            }
        }
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        self.connector
            .connection()
            .remove_listener(&self.listener_name);
    }
}

/// Last path segment of a destination: `/exchange/orders/created` -> `created`.
fn routing_key(destination: &str) -> &str {
    destination.rsplit('/').next().unwrap_or(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::records::{InboxRecord, Status};
    use crate::infrastructure::InMemoryInboxStore;
    use crate::testing::{capture_logs, logged_containing, message_frame, RecordingConnection};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn consumer_with(
        config: ConsumerConfig,
    ) -> (Consumer, Arc<RecordingConnection>, Arc<InMemoryInboxStore>) {
        let connection = Arc::new(RecordingConnection::new());
        let inbox = Arc::new(InMemoryInboxStore::new());
        let consumer = Consumer::new(
            connection.clone(),
            Credentials::new("guest", "guest"),
            inbox.clone(),
            ConsumerConfig {
                backoff: Backoff::new(Duration::ZERO),
                ..config
            },
        );
        (consumer, connection, inbox)
    }

    fn consumer() -> (Consumer, Arc<RecordingConnection>, Arc<InMemoryInboxStore>) {
        consumer_with(ConsumerConfig::default())
    }

    fn callback<F>(f: F) -> Callback
    where
        F: Fn(&mut Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn saving(calls: Arc<AtomicUsize>) -> Callback {
        callback(move |payload: &mut Payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            payload.save();
            Ok(())
        })
    }

    fn deliver(consumer: &Consumer, connection: &RecordingConnection, message_id: &str, headers: &[(&str, &str)]) {
        let id = consumer.subscribe_id().expect("subscribed");
        connection.deliver(&message_frame(&id, message_id, r#"{"id":1}"#, headers));
    }

    // ── subscription ─────────────────────────────────────────────────────────

    #[test]
    fn start_declares_dlq_then_subscribes() {
        let (consumer, connection, _) = consumer();
        consumer
            .start(saving(Arc::default()), "/exchange/events/orders", None)
            .expect("start");

        let subs = connection.subscriptions();
        assert_eq!(subs.len(), 2);
        let dlq = &subs[0];
        assert_eq!(dlq.destination, "/queue/DLQ.orders");
        assert_eq!(dlq.headers["x-queue-name"], "DLQ.orders");
        assert_eq!(dlq.headers["x-dead-letter-routing-key"], "DLQ.DLQ.orders");
        assert_eq!(connection.unsubscribed(), vec![dlq.id.clone()]);

        let main = &subs[1];
        assert_eq!(main.destination, "/exchange/events/orders");
        assert_eq!(main.ack, AckMode::Client);
        assert_eq!(main.headers["x-queue-name"], "orders");
        assert_eq!(main.headers["x-dead-letter-routing-key"], "DLQ.orders");
        assert_eq!(main.headers["x-dead-letter-exchange"], "");
        assert_eq!(main.headers["exclusive"], "false");
        assert_eq!(main.headers["durable"], "true");
        assert_eq!(main.headers["prefetch-count"], "1");
        assert_eq!(Some(main.id.clone()), consumer.subscribe_id());
        assert_eq!(consumer.state(), SubscriptionState::Subscribed);
    }

    #[test]
    fn explicit_queue_name_wins() {
        let (consumer, connection, _) = consumer();
        consumer
            .start(saving(Arc::default()), "/topic/orders", Some("billing-orders"))
            .expect("start");
        assert_eq!(connection.subscriptions()[1].headers["x-queue-name"], "billing-orders");
    }

    #[test]
    fn reconnect_reuses_subscription_id() {
        let (consumer, connection, _) = consumer();
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");
        let id = consumer.subscribe_id().expect("subscribed");

        connection.drop_connection();

        assert!(connection.is_connected());
        let subs = connection.subscriptions();
        assert_eq!(subs.len(), 3, "no second DLQ declaration");
        assert_eq!(subs[2].id, id);
    }

    #[test]
    fn no_reconnect_after_stop() {
        let (consumer, connection, _) = consumer();
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");
        consumer.stop(None);

        connection.drop_connection();
        assert!(!connection.is_connected());
        assert_eq!(connection.connect_calls(), 1);
    }

    // ── message pipeline ─────────────────────────────────────────────────────

    #[test]
    fn duplicate_msg_id_runs_callback_once_and_acks_both() {
        let (consumer, connection, inbox) = consumer();
        let calls = Arc::new(AtomicUsize::new(0));
        consumer
            .start(saving(calls.clone()), "/queue/orders", None)
            .expect("start");

        deliver(&consumer, &connection, "m-1", &[("dop-msg-id", "abc")]);
        deliver(&consumer, &connection, "m-2", &[("dop-msg-id", "abc")]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(inbox.len(), 1);
        let stored = inbox.find_by_msg_id("abc").expect("find").expect("stored");
        assert_eq!(stored.status, Status::Succeeded);
        assert_eq!(stored.body, json!({"id": 1}));
        assert_eq!(connection.acks(), vec!["ack-m-1".to_string(), "ack-m-2".to_string()]);
        assert!(connection.nacks().is_empty());
    }

    #[test]
    fn callback_error_nacks_without_requeue() {
        let (consumer, connection, inbox) = consumer();
        consumer
            .start(
                callback(|payload: &mut Payload| {
                    payload.save();
                    anyhow::bail!("boom")
                }),
                "/queue/orders",
                None,
            )
            .expect("start");

        let id = consumer.subscribe_id().expect("subscribed");
        let outcome = consumer
            .inner
            .dispatch(message_frame(&id, "m-1", "{}", &[("dop-msg-id", "abc")]));

        assert_eq!(outcome, Some(HandleOutcome::Nacked));
        assert!(inbox.is_empty());
        assert_eq!(connection.nacks(), vec![("ack-m-1".to_string(), false)]);
        assert!(connection.acks().is_empty());
    }

    #[test]
    fn callback_panic_is_contained() {
        let (consumer, connection, inbox) = consumer();
        consumer
            .start(
                callback(|_: &mut Payload| panic!("bad message")),
                "/queue/orders",
                None,
            )
            .expect("start");

        deliver(&consumer, &connection, "m-1", &[]);
        assert!(inbox.is_empty());
        assert_eq!(connection.nacks().len(), 1);
    }

    #[test]
    fn unsettled_message_is_left_for_redelivery() {
        capture_logs();
        let (consumer, connection, inbox) = consumer();
        consumer
            .start(callback(|_: &mut Payload| Ok(())), "/queue/orders", None)
            .expect("start");

        let msg_id = format!("unsettled-{}", Uuid::new_v4());
        let outcome = consumer.message_handler(
            "{}",
            &Headers::from([
                ("message-id".to_string(), "m-1".to_string()),
                ("dop-msg-id".to_string(), msg_id.clone()),
            ]),
        );

        assert_eq!(outcome, HandleOutcome::Unacknowledged);
        assert!(connection.acks().is_empty());
        assert!(connection.nacks().is_empty());
        assert!(inbox.is_empty());

        let warnings = logged_containing(&msg_id);
        assert_eq!(warnings.len(), 1, "{:?}", warnings);
        assert!(warnings[0].starts_with("WARN"));
        assert!(warnings[0].contains("was not executed"));
    }

    #[test]
    fn explicit_nack_is_respected() {
        let (consumer, connection, inbox) = consumer();
        consumer
            .start(
                callback(|payload: &mut Payload| {
                    payload.nack()?;
                    Ok(())
                }),
                "/queue/orders",
                None,
            )
            .expect("start");

        deliver(&consumer, &connection, "m-1", &[]);
        assert_eq!(connection.nacks(), vec![("ack-m-1".to_string(), false)]);
        assert!(inbox.is_empty());
    }

    #[test]
    fn malformed_body_reaches_the_callback_raw() {
        let (consumer, _connection, inbox) = consumer();
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");

        let outcome = consumer.message_handler(
            "not json",
            &Headers::from([
                ("message-id".to_string(), "m-1".to_string()),
                ("cap-msg-id".to_string(), "cap-1".to_string()),
            ]),
        );

        assert_eq!(outcome, HandleOutcome::Acked);
        let stored = inbox.find_by_msg_id("cap-1").expect("find").expect("stored");
        assert_eq!(stored.body, Value::String("not json".to_string()));
    }

    #[test]
    fn correlation_id_reaches_the_callback() {
        let (consumer, connection, _) = consumer();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        consumer
            .start(
                callback(move |payload: &mut Payload| {
                    *sink.lock().unwrap() = Some(payload.context().correlation_id.clone());
                    payload.save();
                    Ok(())
                }),
                "/queue/orders",
                None,
            )
            .expect("start");

        deliver(&consumer, &connection, "m-1", &[("dop-correlation-id", "corr-9")]);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("corr-9"));
    }

    #[test]
    fn stale_subscription_frames_are_ignored() {
        let (consumer, connection, _) = consumer();
        let calls = Arc::new(AtomicUsize::new(0));
        consumer
            .start(saving(calls.clone()), "/queue/orders", None)
            .expect("start");

        connection.deliver(&message_frame("old-subscription", "m-1", "{}", &[]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(connection.acks().is_empty());
    }

    #[test]
    fn old_inbox_records_are_pruned_once() {
        let (consumer, connection, inbox) = consumer();
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");
        let aged = |msg_id: &str, days: i64| {
            let mut record = InboxRecord::new(Some(msg_id.to_string()), json!({}), Headers::new());
            record.added = Utc::now() - chrono::Duration::days(days);
            inbox.put(record).expect("put");
        };
        aged("d29", 29);
        aged("d30", 30);
        aged("d31", 31);

        deliver(&consumer, &connection, "m-1", &[]);
        assert!(inbox.exists("d29").expect("exists"));
        assert!(inbox.exists("d30").expect("exists"));
        assert!(!inbox.exists("d31").expect("exists"));

        aged("d45", 45);
        deliver(&consumer, &connection, "m-2", &[]);
        assert!(inbox.exists("d45").expect("exists"));
    }

    // ── background processing and shutdown ───────────────────────────────────

    #[test]
    fn background_pool_processes_and_drains() {
        let (consumer, connection, inbox) = consumer_with(ConsumerConfig {
            background_processing: true,
            workers: 2,
            ..Default::default()
        });
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");

        for i in 0..5 {
            let msg_id = format!("id-{}", i);
            deliver(&consumer, &connection, &format!("m-{}", i), &[("dop-msg-id", msg_id.as_str())]);
        }
        assert!(consumer.stop(None));
        assert_eq!(inbox.len(), 5);
        assert_eq!(connection.acks().len(), 5);
    }

    #[test]
    fn shut_down_pool_is_replaced() {
        let (consumer, connection, inbox) = consumer_with(ConsumerConfig {
            background_processing: true,
            ..Default::default()
        });
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");
        deliver(&consumer, &connection, "m-1", &[("dop-msg-id", "a")]);

        let old = consumer.inner.pool.lock().unwrap().clone().expect("pool");
        old.shutdown(true);
        deliver(&consumer, &connection, "m-2", &[("dop-msg-id", "b")]);

        assert!(consumer.stop(None));
        assert_eq!(inbox.len(), 2);
    }

    #[test]
    fn frames_during_shutdown_stay_unacknowledged() {
        let (consumer, connection, _) = consumer();
        consumer
            .start(saving(Arc::default()), "/queue/orders", None)
            .expect("start");
        let id = consumer.subscribe_id().expect("subscribed");
        consumer.inner.shutdown.store(true, Ordering::SeqCst);

        let outcome = consumer.inner.dispatch(message_frame(&id, "m-1", "{}", &[]));
        assert_eq!(outcome, Some(HandleOutcome::Dropped));
        assert!(connection.acks().is_empty());
    }

    #[test]
    fn stop_with_timeout_still_unsubscribes_and_disconnects() {
        let (consumer, connection, _) = consumer_with(ConsumerConfig {
            background_processing: true,
            ..Default::default()
        });
        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        consumer
            .start(
                callback(move |payload: &mut Payload| {
                    let _ = started_tx.lock().unwrap().send(());
                    thread::sleep(Duration::from_millis(1_500));
                    payload.save();
                    Ok(())
                }),
                "/queue/orders",
                None,
            )
            .expect("start");
        let id = consumer.subscribe_id().expect("subscribed");
        deliver(&consumer, &connection, "m-1", &[]);
        started_rx.recv().expect("callback started");

        let began = Instant::now();
        let drained = consumer.stop(Some(Duration::from_millis(200)));

        assert!(!drained);
        assert!(began.elapsed() < Duration::from_millis(1_000));
        assert_eq!(connection.unsubscribed().last(), Some(&id));
        assert_eq!(connection.disconnect_calls(), 1);
        assert_eq!(consumer.state(), SubscriptionState::Unsubscribed);
        assert_eq!(connection.listener_count(), 0);
    }

    #[test]
    fn stop_before_start_only_logs() {
        let (consumer, connection, _) = consumer();
        assert!(consumer.stop(Some(Duration::from_millis(10))));
        assert_eq!(connection.disconnect_calls(), 0);
    }

    #[test]
    fn routing_key_is_last_segment() {
        assert_eq!(routing_key("/exchange/events/orders"), "orders");
        assert_eq!(routing_key("orders"), "orders");
        assert_eq!(routing_key("/queue/"), "");
    }
}
