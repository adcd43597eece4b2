use std::future::Future;
use std::process;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use log::{error, info, warn};

use stomp_outbox::cli::{self, Cli, Command};
use stomp_outbox::infrastructure::{PgInboxStore, PgOutboxStore};
use stomp_outbox::{
    create_pool, purge, run_migrations, CallbackRegistry, OutboxError, PurgeOptions, Settings,
};

/// Exit code used when a second interrupt skips the graceful shutdown.
const FORCED_EXIT: i32 = 130;

/// Resolves on the first Ctrl-C and arms a second one that exits at once.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for interrupts: {}", e);
        return;
    }
    warn!("Interrupt received, shutting down gracefully (press Ctrl-C again to force)");
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Forced shutdown");
            process::exit(FORCED_EXIT);
        }
    });
}

async fn join<T>(
    task: impl Future<Output = Result<T, tokio::task::JoinError>>,
) -> Result<T, OutboxError> {
    task.await
        .map_err(|e| OutboxError::Config(format!("worker task failed: {}", e)))
}

async fn run(cli: Cli, settings: Settings) -> Result<(), OutboxError> {
    let pool = create_pool(settings.database_url()?)?;
    run_migrations(&pool)?;

    match cli.command {
        Command::Publish => {
            let producer = Arc::new(cli::producer(&settings, pool));
            let runner = Arc::clone(&producer);
            let mut task = tokio::task::spawn_blocking(move || runner.run());
            tokio::select! {
                result = join(&mut task) => return result,
                _ = interrupted() => producer.request_shutdown(),
            }
            info!("Waiting for the current batch to finish");
            join(task).await?;
        }
        Command::Subscribe {
            callback,
            destination,
            queue_name,
        } => {
            let callback = CallbackRegistry::with_builtins().resolve(&callback)?;
            let consumer = Arc::new(cli::consumer(&settings, pool));
            let starter = Arc::clone(&consumer);
            join(tokio::task::spawn_blocking(move || {
                starter.start(callback, &destination, queue_name.as_deref())
            }))
            .await??;
            info!("Waiting for messages");

            interrupted().await;
            let timeout = settings.shutdown_timeout;
            let drained = join(tokio::task::spawn_blocking(move || consumer.stop(timeout))).await?;
            if !drained {
                warn!("Consumer stopped before every message finished");
            }
        }
        Command::Purge(args) => {
            let options = PurgeOptions::from(args);
            let received = PgInboxStore::new(pool.clone());
            let published = PgOutboxStore::new(pool);
            let report =
                join(tokio::task::spawn_blocking(move || purge(&received, &published, &options)))
                    .await??;
            info!(
                "Purged {} received and {} published messages",
                report.received, report.published
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let cli = Cli::parse();
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(cli, settings).await {
        error!("{}", e);
        process::exit(1);
    }
}
