//! Broker-facing capability: what the producer and consumer need from a
//! STOMP connection, plus a concrete client speaking STOMP 1.2 over TCP.

pub mod frame;
pub mod stomp;
pub mod tls;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::domain::errors::TransportError;
use crate::domain::records::Headers;

pub use frame::Frame;
pub use stomp::{BrokerConfig, StompConnection};
pub use tls::TlsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub passcode: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, passcode: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            passcode: passcode.into(),
        }
    }
}

/// Callbacks fired by a connection, usually from its I/O thread.
pub trait ConnectionListener: Send + Sync {
    fn on_connecting(&self, _host: &str, _port: u16) {}
    fn on_connected(&self, _frame: &Frame) {}
    fn on_disconnected(&self) {}
    fn on_message(&self, _frame: &Frame) {}
    fn on_error(&self, _frame: &Frame) {}
    fn on_send(&self, _frame: &Frame) {}
}

pub trait Connection: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<(), TransportError>;
    fn disconnect(&self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;

    fn subscribe(
        &self,
        destination: &str,
        id: &str,
        ack: AckMode,
        headers: &Headers,
    ) -> Result<(), TransportError>;
    fn unsubscribe(&self, id: &str) -> Result<(), TransportError>;

    /// Send one frame. Returns only once the broker has taken the frame.
    fn send(&self, destination: &str, body: &str, headers: &Headers)
        -> Result<(), TransportError>;

    fn ack(&self, id: &str) -> Result<(), TransportError>;
    fn nack(&self, id: &str, requeue: bool) -> Result<(), TransportError>;

    fn set_listener(&self, name: &str, listener: Arc<dyn ConnectionListener>);
    fn remove_listener(&self, name: &str);
}

/// Named listeners. Dispatch works on a snapshot so callbacks may add or
/// remove listeners without deadlocking.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<BTreeMap<String, Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub fn insert(&self, name: &str, listener: Arc<dyn ConnectionListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(name.to_string(), listener);
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.remove(name);
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .read()
            .map(|l| l.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
