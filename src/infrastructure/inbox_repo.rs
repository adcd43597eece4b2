use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::errors::StoreError;
use crate::domain::ports::{InboxStore, PurgeableStore};
use crate::domain::records::{InboxRecord, Status};
use crate::schema::received;

use super::models::ReceivedRow;
use super::outbox_repo::status_codes;

/// Inbox backed by the `received` table. The unique index on `msg_id` is
/// what makes duplicate inserts lose.
#[derive(Clone)]
pub struct PgInboxStore {
    pool: DbPool,
}

impl PgInboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl InboxStore for PgInboxStore {
    fn exists(&self, msg_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        Ok(diesel::select(diesel::dsl::exists(
            received::table.filter(received::msg_id.eq(msg_id)),
        ))
        .get_result(&mut conn)?)
    }

    fn insert_if_absent(&self, record: &InboxRecord) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        let inserted = diesel::insert_into(received::table)
            .values(&ReceivedRow::from(record))
            .on_conflict(received::msg_id)
            .do_nothing()
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    fn find_by_msg_id(&self, msg_id: &str) -> Result<Option<InboxRecord>, StoreError> {
        let mut conn = self.pool.get()?;
        received::table
            .filter(received::msg_id.eq(msg_id))
            .select(ReceivedRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(InboxRecord::try_from)
            .transpose()
    }

    fn delete_added_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        Ok(diesel::delete(received::table.filter(received::added.lt(cutoff)))
            .execute(&mut conn)?)
    }
}

impl PurgeableStore for PgInboxStore {
    fn label(&self) -> &'static str {
        "received"
    }

    fn count_purgeable(
        &self,
        added_until: DateTime<Utc>,
        statuses: &[Status],
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.get()?;
        Ok(received::table
            .filter(received::added.le(added_until))
            .filter(received::status.eq_any(status_codes(statuses)))
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
        let ids: Vec<Uuid> = received::table
            .filter(received::added.le(added_until))
            .filter(received::status.eq_any(status_codes(statuses)))
            .select(received::id)
            .limit(batch_size)
            .load(&mut conn)?;
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(diesel::delete(received::table.filter(received::id.eq_any(&ids)))
            .execute(&mut conn)?)
    }
}
