use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::errors::StoreError;
use crate::domain::ports::{OutboxStore, PurgeableStore};
use crate::domain::records::{NewOutboxRecord, OutboxRecord, Status};
use crate::errors::OutboxError;
use crate::schema::published;

use super::models::{headers_to_json, PublishedRow};

// ── Error conversions (infrastructure concern only) ──────────────────────────

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match e {
            Error::DatabaseError(
                DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand,
                info,
            ) => StoreError::Unavailable(info.message().to_string()),
            Error::DeserializationError(err) | Error::SerializationError(err) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl From<diesel::result::Error> for OutboxError {
    fn from(e: diesel::result::Error) -> Self {
        OutboxError::Store(e.into())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub(crate) fn status_codes(statuses: &[Status]) -> Vec<i32> {
    statuses.iter().map(|s| s.code()).collect()
}

// ── Repository ────────────────────────────────────────────────────────────────

/// Outbox backed by the `published` table.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: DbPool,
}

impl PgOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert `record` on a connection the caller already holds, typically
    /// inside the transaction that writes the business change it announces.
    pub fn insert_with(
        conn: &mut PgConnection,
        record: NewOutboxRecord,
    ) -> Result<OutboxRecord, StoreError> {
        let record = record.into_record();
        diesel::insert_into(published::table)
            .values(&PublishedRow::from(&record))
            .execute(conn)?;
        Ok(record)
    }
}

impl OutboxStore for PgOutboxStore {
    fn insert(&self, record: NewOutboxRecord) -> Result<OutboxRecord, StoreError> {
        let mut conn = self.pool.get()?;
        Self::insert_with(&mut conn, record)
    }

    fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
        let mut conn = self.pool.get()?;
        published::table
            .find(id)
            .select(PublishedRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(OutboxRecord::try_from)
            .transpose()
    }

    fn has_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        Ok(diesel::select(diesel::dsl::exists(
            published::table
                .filter(published::status.eq(Status::Schedule.code()))
                .filter(published::expires_at.ge(now)),
        ))
        .get_result(&mut conn)?)
    }

    fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        handler: &mut dyn FnMut(&mut OutboxRecord),
    ) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        let mut handled: Vec<Uuid> = Vec::new();

        // One row per transaction: each outcome commits on its own and a
        // failure only rolls back the record being handled.
        while handled.len() < limit {
            let next = conn.transaction::<_, StoreError, _>(|conn| {
                // Rows locked by a concurrent poller are skipped, never waited on.
                let row = published::table
                    .filter(published::status.eq(Status::Schedule.code()))
                    .filter(published::expires_at.ge(now))
                    .filter(published::id.ne_all(&handled))
                    .order(published::added.asc())
                    .limit(1)
                    .select(PublishedRow::as_select())
                    .for_update()
                    .skip_locked()
                    .get_result(conn)
                    .optional()?;
                let Some(row) = row else {
                    return Ok(None);
                };

                let mut record = OutboxRecord::try_from(row)?;
                handler(&mut record);
                diesel::update(published::table.find(record.id))
                    .set((
                        published::status.eq(record.status.code()),
                        published::retry.eq(record.retry),
                        published::expires_at.eq(record.expires_at),
                        published::headers.eq(headers_to_json(&record.headers)),
                    ))
                    .execute(conn)?;
                Ok(Some(record.id))
            })?;
            match next {
                Some(id) => handled.push(id),
                None => break,
            }
        }
        Ok(handled.len())
    }

    fn delete_added_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        Ok(diesel::delete(published::table.filter(published::added.lt(cutoff)))
            .execute(&mut conn)?)
    }
}

impl PurgeableStore for PgOutboxStore {
    fn label(&self) -> &'static str {
        "published"
    }

    fn count_purgeable(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.get()?;
        Ok(published::table
            .filter(published::added.le(added_until))
            .filter(published::status.eq_any(status_codes(statuses)))
            .count()
            .get_result(&mut conn)?)
    }

    fn delete_purgeable_batch(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
        batch_size: i64,
    ) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        let ids: Vec<Uuid> = published::table
            .filter(published::added.le(added_until))
            .filter(published::status.eq_any(status_codes(statuses)))
            .select(published::id)
            .limit(batch_size)
            .load(&mut conn)?;
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(diesel::delete(published::table.filter(published::id.eq_any(&ids)))
            .execute(&mut conn)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::db::test_db::setup_db;

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);

        let inserted = store
            .insert(NewOutboxRecord::new("orders", json!({"n": 1})).with_version("v1"))
            .expect("insert failed");

        let found = store
            .find(inserted.id)
            .expect("find failed")
            .expect("record should exist");

        assert_eq!(found.destination, "orders.v1");
        assert_eq!(found.version.as_deref(), Some("v1"));
        assert_eq!(found.body, json!({"n": 1}));
        assert_eq!(found.status, Status::Schedule);
        assert_eq!(found.retry, 0);
    }

    #[tokio::test]
    async fn process_due_skips_expired_and_finished_records() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();

        let due = store
            .insert(NewOutboxRecord::new("orders", json!({})))
            .expect("insert failed");
        store
            .insert(NewOutboxRecord::new("orders", json!({})).with_expires_at(now - Duration::hours(1)))
            .expect("insert failed");

        let mut seen = Vec::new();
        let handled = store
            .process_due(now, 10, &mut |record| {
                seen.push(record.id);
                record.status = Status::Succeeded;
                record.retry = 2;
            })
            .expect("process failed");

        assert_eq!(handled, 1);
        assert_eq!(seen, vec![due.id]);

        let saved = store.find(due.id).expect("find failed").expect("exists");
        assert_eq!(saved.status, Status::Succeeded);
        assert_eq!(saved.retry, 2);

        let again = store
            .process_due(Utc::now(), 10, &mut |_| panic!("nothing should be due"))
            .expect("process failed");
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn process_due_respects_chunk_size_and_age_order() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();

        let older = store
            .insert(NewOutboxRecord::new("a", json!({})).with_added(now - Duration::minutes(5)))
            .expect("insert failed");
        store
            .insert(NewOutboxRecord::new("b", json!({})))
            .expect("insert failed");

        let mut seen = Vec::new();
        store
            .process_due(now, 1, &mut |record| seen.push(record.id))
            .expect("process failed");

        assert_eq!(seen, vec![older.id]);
    }

    #[tokio::test]
    async fn concurrent_pollers_never_share_a_record() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        for i in 0..20 {
            store
                .insert(NewOutboxRecord::new("orders", json!({ "i": i })))
                .expect("insert failed");
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let seen = Arc::clone(&seen);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    loop {
                        let handled = store
                            .process_due(Utc::now(), 5, &mut |record| {
                                thread::sleep(StdDuration::from_millis(10));
                                seen.lock().unwrap().push(record.id);
                                record.status = Status::Succeeded;
                            })
                            .expect("process failed");
                        if handled == 0 {
                            break;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("poller panicked");
        }

        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn process_due_commits_each_record_before_the_next() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();
        for minutes in [3, 2, 1] {
            store
                .insert(NewOutboxRecord::new("a", json!({})).with_added(now - Duration::minutes(minutes)))
                .expect("insert failed");
        }

        let observer = store.clone();
        let mut seen: Vec<Uuid> = Vec::new();
        let mut committed_before = Vec::new();
        store
            .process_due(now, 10, &mut |record| {
                if let Some(previous) = seen.last() {
                    let saved = observer.find(*previous).expect("find failed").expect("exists");
                    committed_before.push(saved.status);
                }
                seen.push(record.id);
                record.status = Status::Succeeded;
            })
            .expect("process failed");

        assert_eq!(seen.len(), 3);
        assert_eq!(committed_before, vec![Status::Succeeded, Status::Succeeded]);
    }

    #[tokio::test]
    async fn process_due_locks_only_the_record_being_handled() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();
        let first = store
            .insert(NewOutboxRecord::new("a", json!({})).with_added(now - Duration::minutes(2)))
            .expect("insert failed");
        let second = store
            .insert(NewOutboxRecord::new("a", json!({})).with_added(now - Duration::minutes(1)))
            .expect("insert failed");

        let other = store.clone();
        let mut taken_by_other = Vec::new();
        let mut outer = Vec::new();
        let handled = store
            .process_due(now, 10, &mut |record| {
                outer.push(record.id);
                other
                    .process_due(now, 10, &mut |inner| {
                        taken_by_other.push(inner.id);
                        inner.status = Status::Succeeded;
                    })
                    .expect("inner process failed");
                record.status = Status::Succeeded;
            })
            .expect("process failed");

        assert_eq!(handled, 1);
        assert_eq!(outer, vec![first.id]);
        assert_eq!(taken_by_other, vec![second.id]);
        assert!(!store.has_due(Utc::now()).expect("has_due failed"));
    }

    #[tokio::test]
    async fn has_due_ignores_expired_records() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();
        store
            .insert(NewOutboxRecord::new("a", json!({})).with_expires_at(now - Duration::hours(1)))
            .expect("insert failed");
        assert!(!store.has_due(now).expect("has_due failed"));

        store
            .insert(NewOutboxRecord::new("a", json!({})))
            .expect("insert failed");
        assert!(store.has_due(now).expect("has_due failed"));
    }

    #[tokio::test]
    async fn delete_added_before_removes_only_older_records() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();

        let old = store
            .insert(NewOutboxRecord::new("a", json!({})).with_added(now - Duration::days(40)))
            .expect("insert failed");
        let fresh = store
            .insert(NewOutboxRecord::new("a", json!({})))
            .expect("insert failed");

        let deleted = store
            .delete_added_before(now - Duration::days(30))
            .expect("delete failed");

        assert_eq!(deleted, 1);
        assert!(store.find(old.id).expect("find failed").is_none());
        assert!(store.find(fresh.id).expect("find failed").is_some());
    }

    #[tokio::test]
    async fn purge_batches_delete_matching_statuses_only() {
        let (_container, pool) = setup_db().await;
        let store = PgOutboxStore::new(pool);
        let old = Utc::now() - Duration::days(40);

        for _ in 0..3 {
            store
                .insert(NewOutboxRecord::new("a", json!({})).with_added(old))
                .expect("insert failed");
        }
        // Mark everything old as delivered except the scheduled one inserted next.
        store
            .process_due(Utc::now(), 10, &mut |record| record.status = Status::Succeeded)
            .expect("process failed");
        store
            .insert(NewOutboxRecord::new("a", json!({})).with_added(old))
            .expect("insert failed");

        let until = Utc::now() - Duration::days(30);
        let finished = [Status::Succeeded, Status::Failed];
        assert_eq!(store.count_purgeable(until, &finished).expect("count"), 3);

        assert_eq!(store.delete_purgeable_batch(until, &finished, 2).expect("delete"), 2);
        assert_eq!(store.delete_purgeable_batch(until, &finished, 2).expect("delete"), 1);
        assert_eq!(store.delete_purgeable_batch(until, &finished, 2).expect("delete"), 0);

        let all = [Status::Succeeded, Status::Failed, Status::Schedule];
        assert_eq!(store.count_purgeable(until, &all).expect("count"), 1);
    }
}
