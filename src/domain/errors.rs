use thiserror::Error;

/// Failures reported by a durable record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached (pool exhausted, connection refused
    /// or dropped). Callers treat this as transient.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Failures reported by a broker connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to the broker")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Broker error: {0}")]
    Broker(String),
    #[error("No receipt for {0} within the receipt timeout")]
    ReceiptTimeout(String),
    #[error("TLS error: {0}")]
    Tls(String),
}
