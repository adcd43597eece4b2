pub mod inbox_repo;
pub mod memory;
pub mod models;
pub mod outbox_repo;

pub use inbox_repo::PgInboxStore;
pub use memory::{InMemoryInboxStore, InMemoryOutboxStore};
pub use outbox_repo::PgOutboxStore;
