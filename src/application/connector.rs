use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::application::policy::{sleep_unless, Backoff};
use crate::broker::{Connection, Credentials};
use crate::domain::errors::TransportError;

/// Connect loop shared by the producer and the consumer.
///
/// Retries forever with exponential backoff; only `cancel` ends the loop
/// without a connection.
pub struct Connector {
    connection: Arc<dyn Connection>,
    credentials: Credentials,
    backoff: Backoff,
    attempts: AtomicU32,
}

impl Connector {
    pub fn new(connection: Arc<dyn Connection>, credentials: Credentials, backoff: Backoff) -> Self {
        Self {
            connection,
            credentials,
            backoff,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Failed attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connect(&self, owner: &str, cancel: &AtomicBool) -> Result<(), TransportError> {
        while !self.connection.is_connected() {
            if cancel.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            match self.connection.connect(&self.credentials) {
                Ok(()) => self.attempts.store(0, Ordering::SeqCst),
                Err(e) => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.backoff.next_delay(attempt);
                    warn!("{} could not connect: {}", owner, e);
                    debug!(
                        "{} waiting for {:.1} seconds before attempting reconnect",
                        owner,
                        delay.as_secs_f64()
                    );
                    if !sleep_unless(cancel, delay) {
                        return Err(TransportError::NotConnected);
                    }
                }
            }
        }
        Ok(())
    }
}
