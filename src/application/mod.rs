pub mod connector;
pub mod consumer;
pub mod context;
pub mod headers;
pub mod listeners;
pub mod payload;
pub mod policy;
pub mod pool;
pub mod producer;
pub mod publish;
pub mod purge;
pub mod registry;

pub use consumer::{Consumer, ConsumerConfig, HandleOutcome, SubscriptionState};
pub use context::MessageContext;
pub use payload::Payload;
pub use policy::{Backoff, RetryPolicy};
pub use producer::{Producer, ProducerConfig, ProducerGuard};
pub use publish::{enqueue, enqueue_in, save_and_publish, PublishConfig, Serializer};
pub use purge::{purge, PurgeOptions, PurgeReport};
pub use registry::{Callback, CallbackRegistry};
