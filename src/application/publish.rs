//! Publish on save: turn a saved entity into outbox records in the same
//! transaction that writes it.

use diesel::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::ports::OutboxStore;
use crate::domain::records::{NewOutboxRecord, OutboxRecord};
use crate::errors::{OutboxError, OutboxResult};
use crate::infrastructure::PgOutboxStore;

/// How an entity becomes a message body.
pub enum Serializer<T> {
    /// `id` plus the named fields of the entity's JSON form; every field
    /// when `None`.
    Fields(Option<Vec<String>>),
    Custom(fn(&T) -> Value),
}

impl<T> Clone for Serializer<T> {
    fn clone(&self) -> Self {
        match self {
            Serializer::Fields(fields) => Serializer::Fields(fields.clone()),
            Serializer::Custom(f) => Serializer::Custom(*f),
        }
    }
}

pub struct PublishConfig<T> {
    pub destination: String,
    pub serializer: Serializer<T>,
    pub version: Option<String>,
}

impl<T> Clone for PublishConfig<T> {
    fn clone(&self) -> Self {
        Self {
            destination: self.destination.clone(),
            serializer: self.serializer.clone(),
            version: self.version.clone(),
        }
    }
}

impl<T> PublishConfig<T> {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            serializer: Serializer::Fields(None),
            version: None,
        }
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.serializer = Serializer::Fields(Some(fields.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn serializer(mut self, f: fn(&T) -> Value) -> Self {
        self.serializer = Serializer::Custom(f);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

pub fn body_for<T: Serialize>(entity: &T, serializer: &Serializer<T>) -> OutboxResult<Value> {
    let fields = match serializer {
        Serializer::Custom(f) => return Ok(f(entity)),
        Serializer::Fields(fields) => fields,
    };
    let Value::Object(all) = serde_json::to_value(entity)? else {
        return Err(OutboxError::Config(
            "published entities must serialize to a JSON object".to_string(),
        ));
    };
    let Some(fields) = fields else {
        return Ok(Value::Object(all));
    };
    let mut body = Map::new();
    if let Some(id) = all.get("id") {
        body.insert("id".to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = all.get(field) {
            body.insert(field.clone(), value.clone());
        }
    }
    Ok(Value::Object(body))
}

pub fn records_for<T: Serialize>(
    entity: &T,
    configs: &[PublishConfig<T>],
) -> OutboxResult<Vec<NewOutboxRecord>> {
    configs
        .iter()
        .map(|config| {
            let record = NewOutboxRecord::new(&config.destination, body_for(entity, &config.serializer)?);
            Ok(match &config.version {
                Some(version) => record.with_version(version),
                None => record,
            })
        })
        .collect()
}

/// Write one outbox record per config through `store`.
pub fn enqueue<T: Serialize>(
    store: &dyn OutboxStore,
    entity: &T,
    configs: &[PublishConfig<T>],
) -> OutboxResult<Vec<OutboxRecord>> {
    records_for(entity, configs)?
        .into_iter()
        .map(|record| store.insert(record).map_err(OutboxError::from))
        .collect()
}

/// Write the outbox records on a connection the caller holds, typically
/// inside its own transaction.
pub fn enqueue_in<T: Serialize>(
    conn: &mut PgConnection,
    entity: &T,
    configs: &[PublishConfig<T>],
) -> OutboxResult<Vec<OutboxRecord>> {
    records_for(entity, configs)?
        .into_iter()
        .map(|record| PgOutboxStore::insert_with(conn, record).map_err(OutboxError::from))
        .collect()
}

/// Run `save` and write the entity's outbox records in one transaction.
/// Nothing is written if either part fails.
pub fn save_and_publish<T, F>(
    conn: &mut PgConnection,
    entity: &T,
    configs: &[PublishConfig<T>],
    save: F,
) -> OutboxResult<Vec<OutboxRecord>>
where
    T: Serialize,
    F: FnOnce(&mut PgConnection) -> Result<(), diesel::result::Error>,
{
    conn.transaction::<_, OutboxError, _>(|conn| {
        save(conn)?;
        enqueue_in(conn, entity, configs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::records::Status;
    use crate::infrastructure::InMemoryOutboxStore;
    use serde_json::json;

    #[derive(Serialize)]
    struct Order {
        id: u32,
        customer: String,
        total: f64,
    }

    fn order() -> Order {
        Order {
            id: 1,
            customer: "ada".to_string(),
            total: 9.5,
        }
    }

    fn summary(order: &Order) -> Value {
        json!({ "order": order.id, "kind": "summary" })
    }

    #[test]
    fn all_fields_by_default() {
        let body = body_for(&order(), &Serializer::Fields(None)).expect("body");
        assert_eq!(body, json!({"id": 1, "customer": "ada", "total": 9.5}));
    }

    #[test]
    fn field_projection_keeps_id() {
        let config = PublishConfig::<Order>::new("orders").fields(&["total", "missing"]);
        let body = body_for(&order(), &config.serializer).expect("body");
        assert_eq!(body, json!({"id": 1, "total": 9.5}));
    }

    #[test]
    fn custom_serializer_is_used() {
        let config = PublishConfig::new("orders").serializer(summary);
        assert_eq!(
            body_for(&order(), &config.serializer).expect("body"),
            json!({"order": 1, "kind": "summary"})
        );
    }

    #[test]
    fn non_object_entities_are_rejected() {
        let err = body_for(&42, &Serializer::Fields(None)).unwrap_err();
        assert!(matches!(err, OutboxError::Config(_)));
    }

    #[test]
    fn enqueue_writes_one_record_per_config() {
        let store = InMemoryOutboxStore::new();
        let configs = vec![
            PublishConfig::new("orders").version("v1"),
            PublishConfig::new("billing").fields(&["total"]),
        ];

        let records = enqueue(&store, &order(), &configs).expect("enqueue");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].destination, "orders.v1");
        assert_eq!(records[1].destination, "billing");
        assert_eq!(records[1].body, json!({"id": 1, "total": 9.5}));
        assert!(records.iter().all(|r| r.status == Status::Schedule));
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn failed_save_leaves_no_outbox_records() {
        use crate::domain::ports::PurgeableStore;

        let (_container, pool) = crate::db::test_db::setup_db().await;
        let mut conn = pool.get().expect("connection");
        let configs = vec![PublishConfig::new("orders")];
        let everything = chrono::Utc::now() + chrono::Duration::days(1);
        let store = PgOutboxStore::new(pool.clone());

        let failed = save_and_publish(&mut conn, &order(), &configs, |_| {
            Err(diesel::result::Error::RollbackTransaction)
        });
        assert!(failed.is_err());
        assert_eq!(store.count_purgeable(everything, &[Status::Schedule]).expect("count"), 0);

        let records = save_and_publish(&mut conn, &order(), &configs, |_| Ok(())).expect("publish");
        assert_eq!(records.len(), 1);
        assert_eq!(store.count_purgeable(everything, &[Status::Schedule]).expect("count"), 1);
    }
}
