use std::fmt;

use uuid::Uuid;

use super::headers::CORRELATION_ID;
use crate::domain::records::Headers;

/// Per-message state handed through the consumer pipeline.
///
/// Its `Display` form is the `[correlation-id]` prefix put on every log line
/// written while the message is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub correlation_id: String,
    pub msg_id: Option<String>,
}

impl MessageContext {
    pub fn from_headers(headers: &Headers) -> Self {
        let correlation_id = headers
            .get(CORRELATION_ID)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            correlation_id,
            msg_id: super::headers::message_id(headers),
        }
    }
}

impl fmt::Display for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.correlation_id)
    }
}
