//! In-memory backend. A single async mutex over the whole table map gives
//! serializable transactions: a transaction owns the lock for its entire
//! lifetime and mutates a working copy that is published on commit.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::query::{Predicate, QueryPlan, SortDirection};
use crate::record::Record;

use super::{Datastore, StoreError, StoreTransaction};

type Tables = HashMap<String, BTreeMap<Uuid, Record>>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(run_query(&tables, entity, plan))
    }

    async fn count(&self, entity: &str, plan: &QueryPlan) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(matching(&tables, entity, plan).count() as u64)
    }

    async fn get(&self, entity: &str, id: Uuid) -> Result<Option<Record>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(entity).and_then(|rows| rows.get(&id)).cloned())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn query(&mut self, entity: &str, plan: &QueryPlan) -> Result<Vec<Record>, StoreError> {
        Ok(run_query(&self.working, entity, plan))
    }

    async fn get_for_update(
        &mut self,
        entity: &str,
        id: Uuid,
    ) -> Result<Option<Record>, StoreError> {
        Ok(self.working.get(entity).and_then(|rows| rows.get(&id)).cloned())
    }

    async fn insert(&mut self, record: &Record) -> Result<(), StoreError> {
        let rows = self.working.entry(record.entity.clone()).or_default();
        if rows.contains_key(&record.id) {
            return Err(StoreError::Query(format!(
                "duplicate id {} in '{}'",
                record.id, record.entity
            )));
        }
        rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&mut self, record: &Record) -> Result<(), StoreError> {
        let row = self
            .working
            .get_mut(&record.entity)
            .and_then(|rows| rows.get_mut(&record.id))
            .ok_or_else(|| {
                StoreError::Query(format!("no row {} in '{}'", record.id, record.entity))
            })?;
        *row = record.clone();
        Ok(())
    }

    async fn delete(&mut self, entity: &str, plan: &QueryPlan) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = matching(&self.working, entity, plan).map(|r| r.id).collect();
        if let Some(rows) = self.working.get_mut(entity) {
            for id in &ids {
                rows.remove(id);
            }
        }
        Ok(ids.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Dropping the working copy (and the lock) is the rollback.
        Ok(())
    }
}

fn run_query(tables: &Tables, entity: &str, plan: &QueryPlan) -> Vec<Record> {
    let mut rows: Vec<Record> = matching(tables, entity, plan).cloned().collect();

    for key in plan.sort.iter().rev() {
        rows.sort_by(|a, b| {
            let ord = compare_values(
                record_value(a, &key.field).as_ref(),
                record_value(b, &key.field).as_ref(),
            );
            match key.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });
    }

    let offset = plan.offset.unwrap_or(0) as usize;
    let mut rows = if offset >= rows.len() { Vec::new() } else { rows.split_off(offset) };
    if let Some(limit) = plan.limit {
        rows.truncate(limit as usize);
    }
    rows
}

fn matching<'t>(
    tables: &'t Tables,
    entity: &str,
    plan: &'t QueryPlan,
) -> impl Iterator<Item = &'t Record> {
    static EMPTY: BTreeMap<Uuid, Record> = BTreeMap::new();
    let rows = tables.get(entity).unwrap_or(&EMPTY);
    let tables_ref = tables;
    rows.values().filter(move |record| {
        if !plan.include_deleted && record.is_deleted() {
            return false;
        }
        plan.predicates.iter().all(|p| matches(tables_ref, record, p))
    })
}

fn matches(tables: &Tables, record: &Record, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Eq { field, value } => {
            record_value(record, field).as_ref().unwrap_or(&Value::Null) == value
        }
        Predicate::Ne { field, value } => {
            record_value(record, field).as_ref().unwrap_or(&Value::Null) != value
        }
        Predicate::Gt { field, value } => ordered(record, field, value, |o| o == Ordering::Greater),
        Predicate::Gte { field, value } => ordered(record, field, value, |o| o != Ordering::Less),
        Predicate::Lt { field, value } => ordered(record, field, value, |o| o == Ordering::Less),
        Predicate::Lte { field, value } => ordered(record, field, value, |o| o != Ordering::Greater),
        Predicate::Between { field, low, high } => {
            ordered(record, field, low, |o| o != Ordering::Less)
                && ordered(record, field, high, |o| o != Ordering::Greater)
        }
        Predicate::In { field, values } => {
            let stored = record_value(record, field).unwrap_or(Value::Null);
            values.contains(&stored)
        }
        Predicate::Search { fields, term } => {
            let needle = term.to_lowercase();
            fields.iter().any(|field| {
                record_value(record, field)
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(|s| s.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
        }
        Predicate::Related { entity, link_field, predicates } => {
            let Some(linked_id) = record
                .field_str(link_field)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                return false;
            };
            let Some(related) = tables.get(entity.as_str()).and_then(|rows| rows.get(&linked_id))
            else {
                return false;
            };
            !related.is_deleted() && predicates.iter().all(|p| matches(tables, related, p))
        }
    }
}

fn ordered(record: &Record, field: &str, value: &Value, check: impl Fn(Ordering) -> bool) -> bool {
    let stored = record_value(record, field);
    match stored {
        Some(stored) if !stored.is_null() && !value.is_null() => {
            check(compare_values(Some(&stored), Some(value)))
        }
        _ => false,
    }
}

/// Resolve a plan field against a record, fixed columns first.
fn record_value(record: &Record, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(record.id.to_string())),
        "entity" => Some(Value::String(record.entity.clone())),
        "tenant" => Some(Value::String(record.tenant.clone())),
        "status" => record.status.clone().map(Value::String),
        "created_at" => Some(Value::String(record.created_at.to_rfc3339())),
        "updated_at" => Some(Value::String(record.updated_at.to_rfc3339())),
        "deleted_at" => record.deleted_at.map(|d| Value::String(d.to_rfc3339())),
        _ => record.fields.get(field).cloned(),
    }
}

/// Total order over JSON values good enough for sorting and ranges:
/// numbers numerically, strings lexicographically (RFC 3339 timestamps sort
/// chronologically that way), everything else by equality only. Missing
/// values sort last.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn record(entity: &str, tenant: &str, fields: Value) -> Record {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Record {
            id: Uuid::new_v4(),
            entity: entity.to_string(),
            tenant: tenant.to_string(),
            status: None,
            fields,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn insert_query_roundtrip_with_predicates() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut txn = store.begin().await?;
        txn.insert(&record("bills", "t1", json!({"amount": 120, "payee": "Meralco"})))
            .await?;
        txn.insert(&record("bills", "t1", json!({"amount": 80, "payee": "Maynilad"})))
            .await?;
        txn.insert(&record("bills", "t2", json!({"amount": 500, "payee": "Meralco"})))
            .await?;
        txn.commit().await?;

        let mut plan = QueryPlan::new();
        plan.push(Predicate::Eq { field: "tenant".into(), value: json!("t1") });
        plan.push(Predicate::Gt { field: "amount".into(), value: json!(100) });
        let rows = store.query("bills", &plan).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field_str("payee"), Some("Meralco"));
        Ok(())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let rec = record("bills", "t1", json!({}));
        let mut txn = store.begin().await?;
        txn.insert(&rec).await?;
        txn.rollback().await?;

        assert!(store.get("bills", rec.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn search_is_case_insensitive() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut txn = store.begin().await?;
        txn.insert(&record("contacts", "t1", json!({"name": "Dr. Reyes"}))).await?;
        txn.commit().await?;

        let mut plan = QueryPlan::new();
        plan.push(Predicate::Search { fields: vec!["name".into()], term: "REYES".into() });
        assert_eq!(store.count("contacts", &plan).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn sort_and_limit_apply_in_order() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut txn = store.begin().await?;
        for amount in [30, 10, 20] {
            txn.insert(&record("bills", "t1", json!({"amount": amount}))).await?;
        }
        txn.commit().await?;

        let plan = QueryPlan {
            sort: vec![crate::query::SortKey {
                field: "amount".into(),
                direction: SortDirection::Desc,
            }],
            limit: Some(2),
            ..QueryPlan::new()
        };
        let rows = store.query("bills", &plan).await?;
        let amounts: Vec<i64> =
            rows.iter().filter_map(|r| r.field("amount").and_then(Value::as_i64)).collect();
        assert_eq!(amounts, vec![30, 20]);
        Ok(())
    }
}
