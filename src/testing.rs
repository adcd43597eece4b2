//! In-process fake of a broker connection and a log capture for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::{AckMode, Connection, ConnectionListener, Credentials, Frame, ListenerSet};
use crate::domain::errors::TransportError;
use crate::domain::records::Headers;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub destination: String,
    pub body: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub destination: String,
    pub id: String,
    pub ack: AckMode,
    pub headers: Headers,
}

#[derive(Default)]
struct Log {
    sent: Vec<SentMessage>,
    acks: Vec<String>,
    nacks: Vec<(String, bool)>,
    subscriptions: Vec<Subscription>,
    unsubscribed: Vec<String>,
}

/// Records every call and lets tests script failures and deliveries.
#[derive(Default)]
pub struct RecordingConnection {
    connected: AtomicBool,
    connect_failures: AtomicU32,
    send_failures: AtomicU32,
    drop_after_sends: AtomicU32,
    connect_calls: AtomicU32,
    send_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    log: Mutex<Log>,
    listeners: ListenerSet,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connects (`u32::MAX` fails forever).
    pub fn fail_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sends (`u32::MAX` fails forever).
    pub fn fail_sends(&self, n: u32) {
        self.send_failures.store(n, Ordering::SeqCst);
    }

    /// Drop the connection right after the `n`-th successful send from now.
    pub fn set_drop_after_sends(&self, n: u32) {
        self.drop_after_sends.store(n, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.log.lock().unwrap().sent.clone()
    }

    pub fn acks(&self) -> Vec<String> {
        self.log.lock().unwrap().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(String, bool)> {
        self.log.lock().unwrap().nacks.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.log.lock().unwrap().subscriptions.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.log.lock().unwrap().unsubscribed.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Hand `frame` to every listener as if the broker had sent it.
    pub fn deliver(&self, frame: &Frame) {
        for listener in self.listeners.snapshot() {
            listener.on_message(frame);
        }
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for listener in self.listeners.snapshot() {
            listener.on_disconnected();
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

/// Build a MESSAGE frame the way a broker would deliver it.
pub fn message_frame(subscription: &str, message_id: &str, body: &str, headers: &[(&str, &str)]) -> Frame {
    let mut frame = Frame::new("MESSAGE")
        .with_header("subscription", subscription)
        .with_header("message-id", message_id)
        .with_header("ack", format!("ack-{}", message_id))
        .with_header("destination", "/queue/orders");
    for (name, value) in headers {
        frame = frame.with_header(*name, *value);
    }
    frame.with_body(body.as_bytes().to_vec())
}

impl Connection for RecordingConnection {
    fn connect(&self, _credentials: &Credentials) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.connect_failures) {
            return Err(TransportError::NotConnected);
        }
        self.connected.store(true, Ordering::SeqCst);
        let connected = Frame::new("CONNECTED").with_header("version", "1.2");
        for listener in self.listeners.snapshot() {
            listener.on_connected(&connected);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            for listener in self.listeners.snapshot() {
                listener.on_disconnected();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(
        &self,
        destination: &str,
        id: &str,
        ack: AckMode,
        headers: &Headers,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log.lock().unwrap().subscriptions.push(Subscription {
            destination: destination.to_string(),
            id: id.to_string(),
            ack,
            headers: headers.clone(),
        });
        Ok(())
    }

    fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log.lock().unwrap().unsubscribed.push(id.to_string());
        Ok(())
    }

    fn send(&self, destination: &str, body: &str, headers: &Headers) -> Result<(), TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        if Self::take_failure(&self.send_failures) {
            return Err(TransportError::ReceiptTimeout("scripted".to_string()));
        }
        let message = SentMessage {
            destination: destination.to_string(),
            body: body.to_string(),
            headers: headers.clone(),
        };
        let frame = Frame::new("SEND")
            .with_header("destination", destination)
            .with_headers(headers)
            .with_body(body.as_bytes().to_vec());
        self.log.lock().unwrap().sent.push(message);
        for listener in self.listeners.snapshot() {
            listener.on_send(&frame);
        }
        let countdown = self
            .drop_after_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if countdown == Ok(1) {
            self.drop_connection();
        }
        Ok(())
    }

    fn ack(&self, id: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log.lock().unwrap().acks.push(id.to_string());
        Ok(())
    }

    fn nack(&self, id: &str, requeue: bool) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log.lock().unwrap().nacks.push((id.to_string(), requeue));
        Ok(())
    }

    fn set_listener(&self, name: &str, listener: Arc<dyn ConnectionListener>) {
        self.listeners.insert(name, listener);
    }

    fn remove_listener(&self, name: &str) {
        self.listeners.remove(name);
    }
}

/// Warnings and errors logged by any test in this process.
static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Ok(mut captured) = CAPTURED.lock() {
                captured.push(format!("{} {}", record.level(), record.args()));
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Route warnings and errors into the process-wide capture. Safe to call
/// from every test that needs it.
pub fn capture_logs() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Warn);
    }
}

/// Captured lines containing `needle`. Tests run in parallel, so callers
/// should look for something unique to them.
pub fn logged_containing(needle: &str) -> Vec<String> {
    CAPTURED
        .lock()
        .map(|captured| {
            captured
                .iter()
                .filter(|line| line.contains(needle))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}
