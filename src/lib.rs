pub mod application;
pub mod broker;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod infrastructure;
pub mod schema;

#[cfg(test)]
mod testing;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub use application::{
    enqueue, enqueue_in, purge, save_and_publish, Callback, CallbackRegistry, Consumer,
    ConsumerConfig, Payload, Producer, ProducerConfig, PublishConfig, PurgeOptions,
};
pub use broker::{BrokerConfig, Connection, Credentials, StompConnection};
pub use config::Settings;
pub use db::{create_pool, DbPool};
pub use domain::records::{Headers, InboxRecord, NewOutboxRecord, OutboxRecord, Status};
pub use domain::errors::{StoreError, TransportError};
pub use errors::{OutboxError, OutboxResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Run any pending Diesel migrations against the pool's database.
pub fn run_migrations(pool: &DbPool) -> Result<(), StoreError> {
    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Query(format!("migrations failed: {}", e)))?;
    Ok(())
}
