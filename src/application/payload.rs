use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use super::context::MessageContext;
use crate::broker::Connection;
use crate::domain::errors::TransportError;
use crate::domain::records::{Headers, InboxRecord, Status};

/// One delivered message as seen by a consumer callback.
///
/// At most one of `ack`/`nack` reaches the broker; repeated or conflicting
/// calls are ignored. `save` marks the pending inbox record as processed,
/// and the consumer writes it and acks once the callback returns.
pub struct Payload {
    pub body: Value,
    pub headers: Headers,
    pub message: InboxRecord,
    context: MessageContext,
    ack_id: Option<String>,
    connection: Arc<dyn Connection>,
    acked: bool,
    nacked: bool,
    saved: bool,
}

impl Payload {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        body: Value,
        headers: Headers,
        context: MessageContext,
    ) -> Self {
        let ack_id = headers
            .get("ack")
            .or_else(|| headers.get("message-id"))
            .cloned();
        let message = InboxRecord::new(context.msg_id.clone(), body.clone(), headers.clone());
        Self {
            body,
            headers,
            message,
            context,
            ack_id,
            connection,
            acked: false,
            nacked: false,
            saved: false,
        }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.context.msg_id.as_deref()
    }

    pub fn ack(&mut self) -> Result<(), TransportError> {
        if self.acked || self.nacked {
            debug!("{} Message already settled, ack ignored", self.context);
            return Ok(());
        }
        let id = self.ack_id()?;
        self.connection.ack(&id)?;
        self.acked = true;
        Ok(())
    }

    /// Reject the message without requeue so the broker dead-letters it.
    pub fn nack(&mut self) -> Result<(), TransportError> {
        if self.acked || self.nacked {
            debug!("{} Message already settled, nack ignored", self.context);
            return Ok(());
        }
        let id = self.ack_id()?;
        self.connection.nack(&id, false)?;
        self.nacked = true;
        Ok(())
    }

    pub fn save(&mut self) {
        if self.nacked {
            warn!("{} save() after nack() ignored", self.context);
            return;
        }
        self.message.status = Status::Succeeded;
        self.saved = true;
    }

    pub fn acked(&self) -> bool {
        self.acked
    }

    pub fn nacked(&self) -> bool {
        self.nacked
    }

    pub fn saved(&self) -> bool {
        self.saved
    }

    fn ack_id(&self) -> Result<String, TransportError> {
        self.ack_id.clone().ok_or_else(|| {
            TransportError::Protocol("message carries neither an ack nor a message-id header".to_string())
        })
    }
}
