use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::StoreError;
use crate::domain::records::{Headers, InboxRecord, OutboxRecord, Status};
use crate::schema::{published, received};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable)]
#[diesel(table_name = published)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PublishedRow {
    pub id: Uuid,
    pub version: Option<String>,
    pub destination: String,
    pub body: Value,
    pub added: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry: i32,
    pub status: i32,
    pub headers: Value,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable)]
#[diesel(table_name = received)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ReceivedRow {
    pub id: Uuid,
    pub msg_id: Option<String>,
    pub headers: Option<Value>,
    pub body: Option<Value>,
    pub added: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry: i32,
    pub status: i32,
}

// ── Conversions ───────────────────────────────────────────────────────────────

/// Read a JSON object of headers. Non-string values are kept in their JSON
/// text form so headers written by other producers still load.
pub fn headers_from_json(value: Value) -> Headers {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect(),
        _ => Headers::new(),
    }
}

pub fn headers_to_json(headers: &Headers) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn status_from_code(code: i32) -> Result<Status, StoreError> {
    Status::from_code(code)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status code {}", code)))
}

impl TryFrom<PublishedRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: PublishedRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            id: row.id,
            version: row.version,
            destination: row.destination,
            body: row.body,
            headers: headers_from_json(row.headers),
            added: row.added,
            expires_at: row.expires_at,
            retry: row.retry,
            status: status_from_code(row.status)?,
        })
    }
}

impl From<&OutboxRecord> for PublishedRow {
    fn from(record: &OutboxRecord) -> Self {
        PublishedRow {
            id: record.id,
            version: record.version.clone(),
            destination: record.destination.clone(),
            body: record.body.clone(),
            added: record.added,
            expires_at: record.expires_at,
            retry: record.retry,
            status: record.status.code(),
            headers: headers_to_json(&record.headers),
        }
    }
}

impl TryFrom<ReceivedRow> for InboxRecord {
    type Error = StoreError;

    fn try_from(row: ReceivedRow) -> Result<Self, Self::Error> {
        Ok(InboxRecord {
            id: row.id,
            msg_id: row.msg_id,
            headers: row.headers.map(headers_from_json).unwrap_or_default(),
            body: row.body.unwrap_or(Value::Null),
            added: row.added,
            expires_at: row.expires_at,
            retry: row.retry,
            status: status_from_code(row.status)?,
        })
    }
}

impl From<&InboxRecord> for ReceivedRow {
    fn from(record: &InboxRecord) -> Self {
        ReceivedRow {
            id: record.id,
            msg_id: record.msg_id.clone(),
            headers: Some(headers_to_json(&record.headers)),
            body: Some(record.body.clone()),
            added: record.added,
            expires_at: record.expires_at,
            retry: record.retry,
            status: record.status.code(),
        }
    }
}
