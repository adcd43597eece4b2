use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use super::payload::Payload;
use crate::errors::{OutboxError, OutboxResult};

/// Consumer callback. An `Err` (or a panic) rejects the message.
pub type Callback = Arc<dyn Fn(&mut Payload) -> anyhow::Result<()> + Send + Sync>;

/// Named consumer callbacks, filled in at startup.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    callbacks: BTreeMap<String, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the callbacks shipped with the crate:
    /// `log` logs each message and marks it processed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", |payload: &mut Payload| {
            info!(
                "{} Received message {:?}: {}",
                payload.context(),
                payload.msg_id(),
                payload.body
            );
            payload.save();
            Ok(())
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, callback: F) -> &mut Self
    where
        F: Fn(&mut Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.to_string(), Arc::new(callback));
        self
    }

    pub fn resolve(&self, name: &str) -> OutboxResult<Callback> {
        self.callbacks
            .get(name)
            .cloned()
            .ok_or_else(|| OutboxError::UnknownCallback(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.callbacks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_is_fatal() {
        let err = CallbackRegistry::new().resolve("missing").err().expect("error");
        assert!(err.is_fatal());
        assert!(matches!(err, OutboxError::UnknownCallback(name) if name == "missing"));
    }

    #[test]
    fn registered_callbacks_resolve() {
        let mut registry = CallbackRegistry::with_builtins();
        registry.register("noop", |_| Ok(()));
        assert!(registry.resolve("noop").is_ok());
        assert!(registry.resolve("log").is_ok());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["log", "noop"]);
    }
}
