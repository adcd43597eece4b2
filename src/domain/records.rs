use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// String headers carried by a record and put on the wire with it.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Failed,
    Schedule,
    Succeeded,
}

impl Status {
    /// Integer code stored in the `status` column.
    pub fn code(self) -> i32 {
        match self {
            Status::Failed => -1,
            Status::Schedule => 1,
            Status::Succeeded => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Status::Failed),
            1 => Some(Status::Schedule),
            2 => Some(Status::Succeeded),
            _ => None,
        }
    }
}

/// Default lifetime of a record before the producer stops picking it up.
pub fn default_expiry(from: DateTime<Utc>) -> DateTime<Utc> {
    from + Duration::days(1)
}

/// A message waiting in (or already delivered from) the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub version: Option<String>,
    pub destination: String,
    pub body: Value,
    pub headers: Headers,
    pub added: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry: i32,
    pub status: Status,
}

/// An outbox record that has not been written yet.
///
/// The id is a random UUID so row identifiers never reveal creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub id: Uuid,
    pub version: Option<String>,
    pub destination: String,
    pub body: Value,
    pub headers: Headers,
    pub added: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewOutboxRecord {
    pub fn new(destination: impl Into<String>, body: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: None,
            destination: destination.into(),
            body,
            headers: Headers::new(),
            added: now,
            expires_at: default_expiry(now),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_added(mut self, added: DateTime<Utc>) -> Self {
        self.added = added;
        self
    }

    /// Destination as stored: the version, when present, is appended as a
    /// suffix (`orders` + `v1` -> `orders.v1`).
    pub fn stored_destination(&self) -> String {
        match &self.version {
            Some(version) => format!("{}.{}", self.destination, version),
            None => self.destination.clone(),
        }
    }

    pub fn into_record(self) -> OutboxRecord {
        let destination = self.stored_destination();
        OutboxRecord {
            id: self.id,
            version: self.version,
            destination,
            body: self.body,
            headers: self.headers,
            added: self.added,
            expires_at: self.expires_at,
            retry: 0,
            status: Status::Schedule,
        }
    }
}

/// A message that was received and processed by a consumer callback.
///
/// At most one record exists per `msg_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: Uuid,
    pub msg_id: Option<String>,
    pub headers: Headers,
    pub body: Value,
    pub added: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry: i32,
    pub status: Status,
}

impl InboxRecord {
    pub fn new(msg_id: Option<String>, body: Value, headers: Headers) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            msg_id,
            headers,
            body,
            added: now,
            expires_at: default_expiry(now),
            retry: 0,
            status: Status::Schedule,
        }
    }

    pub fn destination(&self) -> &str {
        self.headers
            .get("destination")
            .map(String::as_str)
            .unwrap_or("")
    }
}
