use chrono::{Duration, Utc};
use log::{info, warn};

use crate::domain::errors::StoreError;
use crate::domain::ports::PurgeableStore;
use crate::domain::records::Status;
use crate::errors::{OutboxError, OutboxResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOptions {
    pub days: i64,
    pub dry_run: bool,
    pub received_only: bool,
    pub published_only: bool,
    pub include_scheduled: bool,
    pub batch_size: i64,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            days: 30,
            dry_run: false,
            received_only: false,
            published_only: false,
            include_scheduled: false,
            batch_size: 500,
        }
    }
}

impl PurgeOptions {
    fn statuses(&self) -> Vec<Status> {
        let mut statuses = vec![Status::Succeeded, Status::Failed];
        if self.include_scheduled {
            statuses.push(Status::Schedule);
        }
        statuses
    }
}

/// Records removed per table, or that would be removed on a dry run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub received: usize,
    pub published: usize,
}

pub fn purge(
    received: &dyn PurgeableStore,
    published: &dyn PurgeableStore,
    options: &PurgeOptions,
) -> OutboxResult<PurgeReport> {
    info!("Purging outbox received/published messages...");
    info!("{:?}", options);
    if options.batch_size <= 0 {
        return Err(OutboxError::Config(format!(
            "batch size must be positive, got {}",
            options.batch_size
        )));
    }
    let mut report = PurgeReport::default();
    if options.received_only && options.published_only {
        warn!("Purge received and purge published options cannot be used together");
        return Ok(report);
    }

    if !options.published_only {
        report.received = purge_table(received, options)?;
    }
    if !options.received_only {
        report.published = purge_table(published, options)?;
    }
    info!("Done!");
    Ok(report)
}

fn purge_table(store: &dyn PurgeableStore, options: &PurgeOptions) -> Result<usize, StoreError> {
    let name = store.label();
    info!("Purging {} messages for {} days...", name, options.days);
    let added_until = Utc::now() - Duration::days(options.days);
    let statuses = options.statuses();

    let total = store.count_purgeable(added_until, &statuses)?.max(0) as usize;
    if options.dry_run {
        warn!("Dry run would delete {} {} messages", total, name);
        return Ok(total);
    }

    let mut deleted = 0;
    loop {
        let batch = store.delete_purgeable_batch(added_until, &statuses, options.batch_size)?;
        if batch == 0 {
            break;
        }
        deleted += batch;
        info!("Deleted {}/{} {} messages", deleted, total, name);
    }
    info!("Deleted total of {} {} messages", deleted, name);
    Ok(deleted)
}
