//! Process-local stores with the same semantics as the Postgres ones.
//!
//! Useful for embedding the producer/consumer without a database and for
//! exercising them in tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::StoreError;
use crate::domain::ports::{InboxStore, OutboxStore, PurgeableStore};
use crate::domain::records::{InboxRecord, NewOutboxRecord, OutboxRecord, Status};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
}

#[derive(Default)]
struct OutboxState {
    records: HashMap<Uuid, OutboxRecord>,
    locked: HashSet<Uuid>,
}

#[derive(Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<OutboxState>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, oldest first.
    pub fn records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<_> = match self.state.lock() {
            Ok(state) => state.records.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        records.sort_by_key(|r| r.added);
        records
    }
}

/// Row lock held while one record is handled, released on every exit path.
struct Claim<'a> {
    state: &'a Mutex<OutboxState>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.locked.remove(&self.id);
        }
    }
}

fn is_due(record: &OutboxRecord, now: DateTime<Utc>) -> bool {
    record.status == Status::Schedule && record.expires_at >= now
}

impl OutboxStore for InMemoryOutboxStore {
    fn insert(&self, record: NewOutboxRecord) -> Result<OutboxRecord, StoreError> {
        let record = record.into_record();
        lock(&self.state)?.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
        Ok(lock(&self.state)?.records.get(&id).cloned())
    }

    fn has_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(lock(&self.state)?.records.values().any(|r| is_due(r, now)))
    }

    fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        handler: &mut dyn FnMut(&mut OutboxRecord),
    ) -> Result<usize, StoreError> {
        let mut handled: Vec<Uuid> = Vec::new();
        while handled.len() < limit {
            let (claim, mut record) = {
                let mut state = lock(&self.state)?;
                let next = state
                    .records
                    .values()
                    .filter(|r| is_due(r, now))
                    .filter(|r| !state.locked.contains(&r.id) && !handled.contains(&r.id))
                    .min_by_key(|r| r.added)
                    .cloned();
                let Some(record) = next else {
                    break;
                };
                state.locked.insert(record.id);
                (
                    Claim {
                        state: &self.state,
                        id: record.id,
                    },
                    record,
                )
            };

            handler(&mut record);

            // Like an UPDATE, a write-back never resurrects a pruned record.
            if let Some(slot) = lock(&self.state)?.records.get_mut(&record.id) {
                *slot = record.clone();
            }
            handled.push(record.id);
            drop(claim);
        }
        Ok(handled.len())
    }

    fn delete_added_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = lock(&self.state)?;
        let before = state.records.len();
        state.records.retain(|_, r| r.added >= cutoff);
        Ok(before - state.records.len())
    }
}

impl PurgeableStore for InMemoryOutboxStore {
    fn label(&self) -> &'static str {
        "published"
    }

    fn count_purgeable(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
    ) -> Result<i64, StoreError> {
        let state = lock(&self.state)?;
        Ok(state
            .records
            .values()
            .filter(|r| r.added <= added_until && statuses.contains(&r.status))
            .count() as i64)
    }

    fn delete_purgeable_batch(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
        batch_size: i64,
    ) -> Result<usize, StoreError> {
        let mut state = lock(&self.state)?;
        let ids: Vec<Uuid> = state
            .records
            .values()
            .filter(|r| r.added <= added_until && statuses.contains(&r.status))
            .map(|r| r.id)
            .take(batch_size.max(0) as usize)
            .collect();
        for id in &ids {
            state.records.remove(id);
        }
        Ok(ids.len())
    }
}

/// Inbox keyed by `msg_id`; records without one are kept under their row id.
#[derive(Default)]
pub struct InMemoryInboxStore {
    records: Mutex<HashMap<String, InboxRecord>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a record directly, bypassing the duplicate check.
    pub fn put(&self, record: InboxRecord) -> Result<(), StoreError> {
        let key = Self::key(&record);
        lock(&self.records)?.insert(key, record);
        Ok(())
    }

    fn key(record: &InboxRecord) -> String {
        record
            .msg_id
            .clone()
            .unwrap_or_else(|| record.id.to_string())
    }
}

impl InboxStore for InMemoryInboxStore {
    fn exists(&self, msg_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.records)?.contains_key(msg_id))
    }

    fn insert_if_absent(&self, record: &InboxRecord) -> Result<bool, StoreError> {
        let mut records = lock(&self.records)?;
        let key = Self::key(record);
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    fn find_by_msg_id(&self, msg_id: &str) -> Result<Option<InboxRecord>, StoreError> {
        Ok(lock(&self.records)?.get(msg_id).cloned())
    }

    fn delete_added_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = lock(&self.records)?;
        let before = records.len();
        records.retain(|_, r| r.added >= cutoff);
        Ok(before - records.len())
    }
}

impl PurgeableStore for InMemoryInboxStore {
    fn label(&self) -> &'static str {
        "received"
    }

    fn count_purgeable(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
    ) -> Result<i64, StoreError> {
        let records = lock(&self.records)?;
        Ok(records
            .values()
            .filter(|r| r.added <= added_until && statuses.contains(&r.status))
            .count() as i64)
    }

    fn delete_purgeable_batch(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
        batch_size: i64,
    ) -> Result<usize, StoreError> {
        let mut records = lock(&self.records)?;
        let keys: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.added <= added_until && statuses.contains(&r.status))
            .map(|(k, _)| k.clone())
            .take(batch_size.max(0) as usize)
            .collect();
        for key in &keys {
            records.remove(key);
        }
        Ok(keys.len())
    }
}
