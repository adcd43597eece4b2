//! Broker event sinks for the producer and the consumer.

use std::sync::Weak;

use log::{debug, info};

use super::consumer::ConsumerInner;
use crate::broker::{ConnectionListener, Frame};

fn log_error(owner: &str, frame: &Frame) {
    debug!(
        "{} received an error {} [{:?}]",
        owner,
        frame.body_text(),
        frame.headers
    );
}

/// Logs connection events. The producer reconnects from its poll loop, so a
/// disconnect needs no action here.
pub struct ProducerListener;

impl ConnectionListener for ProducerListener {
    fn on_connecting(&self, host: &str, port: u16) {
        debug!("Producer attempting connection to host {} port {}", host, port);
    }

    fn on_connected(&self, _frame: &Frame) {
        debug!("Producer established connection");
    }

    fn on_disconnected(&self) {
        debug!("Producer disconnected");
    }

    fn on_error(&self, frame: &Frame) {
        log_error("Producer", frame);
    }

    fn on_send(&self, frame: &Frame) {
        if frame.command == "SEND" {
            debug!("Message body sent: {}", frame.body_text());
            debug!("Message headers sent: {:?}", frame.headers);
        }
    }
}

/// Routes MESSAGE frames of the current subscription into the consumer and
/// resubscribes after an unexpected disconnect.
///
/// Holds the consumer weakly: the connection owns its listeners and the
/// consumer owns the connection.
pub struct ConsumerListener {
    pub(crate) consumer: Weak<ConsumerInner>,
}

impl ConnectionListener for ConsumerListener {
    fn on_connecting(&self, host: &str, port: u16) {
        debug!("Consumer attempting connection to host {} port {}", host, port);
    }

    fn on_connected(&self, _frame: &Frame) {
        debug!("Consumer established connection");
    }

    fn on_disconnected(&self) {
        debug!("Consumer disconnected");
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.reconnect();
        }
    }

    fn on_error(&self, frame: &Frame) {
        log_error("Consumer", frame);
    }

    fn on_message(&self, frame: &Frame) {
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        let Some(subscription) = frame.header("subscription") else {
            debug!("Dropping MESSAGE frame without a subscription header");
            return;
        };
        if !consumer.is_current_subscription(subscription) {
            debug!("Ignoring frame for stale subscription {}", subscription);
            return;
        }
        info!(
            "Message id received: {}",
            frame.header("message-id").unwrap_or("<none>")
        );
        debug!("Message body received: {}", frame.body_text());
        debug!("Message headers received: {:?}", frame.headers);
        consumer.dispatch(frame.clone());
    }
}
