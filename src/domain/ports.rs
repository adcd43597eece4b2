use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::errors::StoreError;
use super::records::{InboxRecord, NewOutboxRecord, OutboxRecord, Status};

/// Durable queue of outgoing messages.
pub trait OutboxStore: Send + Sync + 'static {
    fn insert(&self, record: NewOutboxRecord) -> Result<OutboxRecord, StoreError>;

    fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, StoreError>;

    /// Whether any record is due at `now`. Takes no locks.
    fn has_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Handle up to `limit` due records (status SCHEDULE, not expired at
    /// `now`), oldest first, skipping rows another caller already holds.
    ///
    /// Records are claimed one at a time. `handler` runs once per record,
    /// and the record is written back and released before the next one is
    /// claimed, whatever the handler did to it. Returns the number of
    /// records handled.
    fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        handler: &mut dyn FnMut(&mut OutboxRecord),
    ) -> Result<usize, StoreError>;

    /// Delete every record added strictly before `cutoff`.
    fn delete_added_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Durable record of processed incoming messages, keyed by `msg_id`.
pub trait InboxStore: Send + Sync + 'static {
    fn exists(&self, msg_id: &str) -> Result<bool, StoreError>;

    /// Insert `record` unless a record with the same `msg_id` exists.
    /// Returns `false` when the insert lost to an existing record.
    fn insert_if_absent(&self, record: &InboxRecord) -> Result<bool, StoreError>;

    fn find_by_msg_id(&self, msg_id: &str) -> Result<Option<InboxRecord>, StoreError>;

    fn delete_added_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Batched time-based deletion used by the purge command.
pub trait PurgeableStore: Send + Sync {
    /// Human name of the table, used in log lines.
    fn label(&self) -> &'static str;

    fn count_purgeable(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
    ) -> Result<i64, StoreError>;

    /// Delete at most `batch_size` matching records; returns how many went.
    fn delete_purgeable_batch(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
        batch_size: i64,
    ) -> Result<usize, StoreError>;
}
