//! Command line surface of the `stomp-outbox` binary.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use crate::application::{Consumer, Producer, PurgeOptions};
use crate::broker::StompConnection;
use crate::config::Settings;
use crate::db::DbPool;
use crate::infrastructure::{PgInboxStore, PgOutboxStore};

#[derive(Parser, Debug)]
#[command(name = "stomp-outbox")]
#[command(version, about = "Transactional outbox and inbox over a STOMP broker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Consume messages from a destination with a registered callback
    Subscribe {
        /// Name of the callback that handles each message
        callback: String,

        /// Destination to subscribe to, e.g. /exchange/orders/created
        destination: String,

        /// Queue name used for the subscription and its dead-letter queue
        #[arg(long)]
        queue_name: Option<String>,
    },

    /// Publish scheduled outbox records until interrupted
    Publish,

    /// Delete old published and received records
    Purge(PurgeArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct PurgeArgs {
    /// Delete records added at least this many days ago
    #[arg(long, default_value_t = 30)]
    pub days: i64,

    /// Only report how many records would be deleted
    #[arg(long)]
    pub dry_run: bool,

    /// Only purge received messages
    #[arg(long)]
    pub purge_received_only: bool,

    /// Only purge published messages
    #[arg(long)]
    pub purge_published_only: bool,

    /// Also delete records that are still scheduled
    #[arg(long)]
    pub include_scheduled: bool,

    /// Rows deleted per statement
    #[arg(long, default_value_t = 500)]
    pub batch_size: i64,
}

impl From<PurgeArgs> for PurgeOptions {
    fn from(args: PurgeArgs) -> Self {
        PurgeOptions {
            days: args.days,
            dry_run: args.dry_run,
            received_only: args.purge_received_only,
            published_only: args.purge_published_only,
            include_scheduled: args.include_scheduled,
            batch_size: args.batch_size,
        }
    }
}

fn connection(settings: &Settings) -> Arc<StompConnection> {
    Arc::new(StompConnection::new(settings.broker()))
}

pub fn producer(settings: &Settings, pool: DbPool) -> Producer {
    Producer::new(
        connection(settings),
        settings.credentials(),
        Arc::new(PgOutboxStore::new(pool)),
        settings.producer(),
    )
}

pub fn consumer(settings: &Settings, pool: DbPool) -> Consumer {
    Consumer::new(
        connection(settings),
        settings.credentials(),
        Arc::new(PgInboxStore::new(pool)),
        settings.consumer(),
    )
}
