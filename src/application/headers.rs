use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::domain::records::{Headers, OutboxRecord};

pub const MSG_ID: &str = "dop-msg-id";
pub const MSG_DESTINATION: &str = "dop-msg-destination";
pub const MSG_TYPE: &str = "dop-msg-type";
pub const MSG_SENT_TIME: &str = "dop-msg-sent-time";
pub const CORRELATION_ID: &str = "dop-correlation-id";

/// Value of `dop-msg-type` for messages coming out of the outbox.
pub const PUBLISHED_TYPE: &str = "Published";

/// Header names that may carry the idempotency key, in lookup order.
pub const MSG_ID_CANDIDATES: [&str; 3] = ["cap-msg-id", MSG_ID, "message-id"];

/// Headers every outbox message carries unless the caller set them.
pub fn default_headers(record: &OutboxRecord, now: DateTime<Utc>) -> Headers {
    Headers::from([
        (MSG_ID.to_string(), record.id.to_string()),
        (MSG_DESTINATION.to_string(), record.destination.clone()),
        (MSG_TYPE.to_string(), PUBLISHED_TYPE.to_string()),
        (
            MSG_SENT_TIME.to_string(),
            now.to_rfc3339_opts(SecondsFormat::Micros, true),
        ),
        (CORRELATION_ID.to_string(), Uuid::new_v4().to_string()),
    ])
}

/// `defaults` overlaid with `explicit`; explicit values win.
pub fn merge(defaults: Headers, explicit: &Headers) -> Headers {
    let mut merged = defaults;
    merged.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// First non-empty idempotency key among [`MSG_ID_CANDIDATES`].
pub fn message_id(headers: &Headers) -> Option<String> {
    MSG_ID_CANDIDATES
        .iter()
        .filter_map(|name| headers.get(*name))
        .find(|value| !value.is_empty())
        .cloned()
}
