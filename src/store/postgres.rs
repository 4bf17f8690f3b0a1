//! Postgres backend. One table per entity: fixed engine columns plus a
//! JSONB `fields` payload. Plans lower to `$n`-parameterized SQL; dynamic
//! fields are addressed with `fields->>'name'` and cast when the operand
//! calls for it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::entity::{is_valid_ident, EntityRegistry};
use crate::query::{Predicate, QueryPlan, SortKey};
use crate::record::Record;

use super::{Datastore, StoreError, StoreTransaction};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using `DATABASE_URL` (a local `.env` is honored).
    pub async fn connect() -> Result<Self, StoreError> {
        let _ = dotenvy::dotenv();
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| StoreError::ConfigMissing("DATABASE_URL"))?;
        let pool = PgPoolOptions::new().connect(&url).await?;
        tracing::info!("connected to postgres");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Provision one table per registered entity. Wallets additionally get
    /// a unique (tenant, owner) index so lazy get-or-create cannot mint
    /// duplicate wallets under concurrency.
    pub async fn ensure_entities(&self, registry: &EntityRegistry) -> Result<(), StoreError> {
        for name in registry.names() {
            let ddl = format!(
                r#"CREATE TABLE IF NOT EXISTS "{name}" (
                    id UUID PRIMARY KEY,
                    tenant TEXT NOT NULL,
                    status TEXT,
                    fields JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    deleted_at TIMESTAMPTZ
                )"#
            );
            sqlx::query(&ddl).execute(&self.pool).await?;

            let idx = format!(
                r#"CREATE INDEX IF NOT EXISTS "{name}_tenant_idx" ON "{name}" (tenant)"#
            );
            sqlx::query(&idx).execute(&self.pool).await?;
            tracing::debug!(entity = name, "ensured entity table");
        }

        let wallet_idx = format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "wallets_tenant_owner_idx"
               ON "{}" (tenant, (fields->>'owner')) WHERE deleted_at IS NULL"#,
            crate::entity::WALLETS
        );
        sqlx::query(&wallet_idx).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Record>, StoreError> {
        let sql = select_sql(entity, plan)?;
        let rows = bind_params(sqlx::query(&sql.text), &sql.params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row_to_record(entity, row)).collect()
    }

    async fn count(&self, entity: &str, plan: &QueryPlan) -> Result<u64, StoreError> {
        let sql = count_sql(entity, plan)?;
        let row = bind_params(sqlx::query(&sql.text), &sql.params)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    async fn get(&self, entity: &str, id: Uuid) -> Result<Option<Record>, StoreError> {
        check_ident(entity)?;
        let sql = format!(r#"SELECT {} FROM "{entity}" WHERE "id" = $1"#, select_columns(entity));
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| row_to_record(entity, &row)).transpose()
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn query(&mut self, entity: &str, plan: &QueryPlan) -> Result<Vec<Record>, StoreError> {
        let sql = select_sql(entity, plan)?;
        let rows = bind_params(sqlx::query(&sql.text), &sql.params)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(|row| row_to_record(entity, row)).collect()
    }

    async fn get_for_update(
        &mut self,
        entity: &str,
        id: Uuid,
    ) -> Result<Option<Record>, StoreError> {
        check_ident(entity)?;
        let sql = format!(
            r#"SELECT {} FROM "{entity}" WHERE "id" = $1 FOR UPDATE"#,
            select_columns(entity)
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.map(|row| row_to_record(entity, &row)).transpose()
    }

    async fn insert(&mut self, record: &Record) -> Result<(), StoreError> {
        check_ident(&record.entity)?;
        let sql = format!(
            r#"INSERT INTO "{}" (id, tenant, status, fields, created_at, updated_at, deleted_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            record.entity
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.tenant)
            .bind(&record.status)
            .bind(Value::Object(record.fields.clone()))
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.deleted_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update(&mut self, record: &Record) -> Result<(), StoreError> {
        check_ident(&record.entity)?;
        let sql = format!(
            r#"UPDATE "{}" SET status = $2, fields = $3, updated_at = $4, deleted_at = $5
               WHERE id = $1"#,
            record.entity
        );
        let result = sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.status)
            .bind(Value::Object(record.fields.clone()))
            .bind(record.updated_at)
            .bind(record.deleted_at)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Query(format!(
                "no row {} in '{}'",
                record.id, record.entity
            )));
        }
        Ok(())
    }

    async fn delete(&mut self, entity: &str, plan: &QueryPlan) -> Result<u64, StoreError> {
        let sql = delete_sql(entity, plan)?;
        let result = bind_params(sqlx::query(&sql.text), &sql.params)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// --- SQL lowering ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Text(String),
    TextArray(Vec<String>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Numeric(f64),
    Bool(bool),
}

#[derive(Debug)]
pub(crate) struct SqlQuery {
    pub text: String,
    pub params: Vec<SqlParam>,
}

fn check_ident(name: &str) -> Result<(), StoreError> {
    if is_valid_ident(name) {
        Ok(())
    } else {
        Err(StoreError::Query(format!("invalid identifier: '{name}'")))
    }
}

fn select_columns(entity: &str) -> String {
    ["id", "tenant", "status", "fields", "created_at", "updated_at", "deleted_at"]
        .iter()
        .map(|c| format!(r#""{entity}"."{c}""#))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_fixed_column(field: &str) -> bool {
    matches!(field, "id" | "tenant" | "status" | "created_at" | "updated_at" | "deleted_at")
}

/// Address a plan field on a table: fixed columns directly, everything else
/// through the JSONB payload.
fn column_expr(entity: &str, field: &str) -> Result<String, StoreError> {
    check_ident(field)?;
    if is_fixed_column(field) {
        Ok(format!(r#""{entity}"."{field}""#))
    } else {
        Ok(format!(r#""{entity}"."fields"->>'{field}'"#))
    }
}

pub(crate) fn select_sql(entity: &str, plan: &QueryPlan) -> Result<SqlQuery, StoreError> {
    check_ident(entity)?;
    let mut params = vec![];
    let where_clause = render_where(entity, plan, &mut params)?;
    let order_clause = render_order(entity, &plan.sort)?;
    let limit_clause = render_limit(plan);

    let text = [
        format!(r#"SELECT {} FROM "{entity}""#, select_columns(entity)),
        if where_clause.is_empty() { String::new() } else { format!("WHERE {where_clause}") },
        order_clause,
        limit_clause,
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ");

    Ok(SqlQuery { text, params })
}

pub(crate) fn count_sql(entity: &str, plan: &QueryPlan) -> Result<SqlQuery, StoreError> {
    check_ident(entity)?;
    let mut params = vec![];
    let where_clause = render_where(entity, plan, &mut params)?;
    let text = if where_clause.is_empty() {
        format!(r#"SELECT COUNT(*) as count FROM "{entity}""#)
    } else {
        format!(r#"SELECT COUNT(*) as count FROM "{entity}" WHERE {where_clause}"#)
    };
    Ok(SqlQuery { text, params })
}

pub(crate) fn delete_sql(entity: &str, plan: &QueryPlan) -> Result<SqlQuery, StoreError> {
    check_ident(entity)?;
    let mut params = vec![];
    let where_clause = render_where(entity, plan, &mut params)?;
    let text = if where_clause.is_empty() {
        format!(r#"DELETE FROM "{entity}""#)
    } else {
        format!(r#"DELETE FROM "{entity}" WHERE {where_clause}"#)
    };
    Ok(SqlQuery { text, params })
}

fn render_where(
    entity: &str,
    plan: &QueryPlan,
    params: &mut Vec<SqlParam>,
) -> Result<String, StoreError> {
    let mut conditions = vec![];
    if !plan.include_deleted {
        conditions.push(format!(r#""{entity}"."deleted_at" IS NULL"#));
    }
    for predicate in &plan.predicates {
        conditions.push(render_predicate(entity, predicate, params)?);
    }
    Ok(conditions.join(" AND "))
}

fn render_predicate(
    entity: &str,
    predicate: &Predicate,
    params: &mut Vec<SqlParam>,
) -> Result<String, StoreError> {
    match predicate {
        Predicate::Eq { field, value } => comparison(entity, field, "=", value, params),
        Predicate::Ne { field, value } => comparison(entity, field, "<>", value, params),
        Predicate::Gt { field, value } => comparison(entity, field, ">", value, params),
        Predicate::Gte { field, value } => comparison(entity, field, ">=", value, params),
        Predicate::Lt { field, value } => comparison(entity, field, "<", value, params),
        Predicate::Lte { field, value } => comparison(entity, field, "<=", value, params),
        Predicate::Between { field, low, high } => {
            let lower = comparison(entity, field, ">=", low, params)?;
            let upper = comparison(entity, field, "<=", high, params)?;
            Ok(format!("({lower} AND {upper})"))
        }
        Predicate::In { field, values } => {
            let column = column_expr(entity, field)?;
            if values.is_empty() {
                // Empty membership can never match.
                return Ok("1=0".to_string());
            }
            let texts: Vec<String> = values.iter().map(value_as_text).collect();
            params.push(SqlParam::TextArray(texts));
            if field == "id" {
                Ok(format!(r#"{column}::text = ANY(${})"#, params.len()))
            } else {
                Ok(format!("{column} = ANY(${})", params.len()))
            }
        }
        Predicate::Search { fields, term } => {
            let escaped = term
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            let mut parts = vec![];
            for field in fields {
                let column = column_expr(entity, field)?;
                params.push(SqlParam::Text(format!("%{escaped}%")));
                parts.push(format!("{column} ILIKE ${}", params.len()));
            }
            if parts.is_empty() {
                return Ok("1=1".to_string());
            }
            Ok(format!("({})", parts.join(" OR ")))
        }
        Predicate::Related { entity: related, link_field, predicates } => {
            check_ident(related)?;
            let link = column_expr(entity, link_field)?;
            let mut inner = vec![
                format!(r#""{related}"."id"::text = {link}"#),
                format!(r#""{related}"."deleted_at" IS NULL"#),
            ];
            for predicate in predicates {
                inner.push(render_predicate(related, predicate, params)?);
            }
            Ok(format!(
                r#"EXISTS (SELECT 1 FROM "{related}" WHERE {})"#,
                inner.join(" AND ")
            ))
        }
    }
}

fn comparison(
    entity: &str,
    field: &str,
    op: &str,
    value: &Value,
    params: &mut Vec<SqlParam>,
) -> Result<String, StoreError> {
    let column = column_expr(entity, field)?;

    if value.is_null() {
        return match op {
            "=" => Ok(format!("{column} IS NULL")),
            "<>" => Ok(format!("{column} IS NOT NULL")),
            _ => Err(StoreError::Query(format!(
                "null operand not supported for '{op}' on '{field}'"
            ))),
        };
    }

    if is_fixed_column(field) {
        let param = match field {
            "id" => {
                let raw = value.as_str().unwrap_or_default();
                let id = Uuid::parse_str(raw)
                    .map_err(|_| StoreError::Query(format!("invalid uuid operand: '{raw}'")))?;
                SqlParam::Uuid(id)
            }
            "created_at" | "updated_at" | "deleted_at" => {
                let raw = value.as_str().unwrap_or_default();
                let ts = DateTime::parse_from_rfc3339(raw).map_err(|_| {
                    StoreError::Query(format!("invalid timestamp operand: '{raw}'"))
                })?;
                SqlParam::Timestamp(ts.with_timezone(&Utc))
            }
            _ => SqlParam::Text(value_as_text(value)),
        };
        params.push(param);
        return Ok(format!("{column} {op} ${}", params.len()));
    }

    // Dynamic fields come back from JSONB as text; cast when the operand
    // demands a typed comparison.
    match value {
        Value::Number(n) => {
            params.push(SqlParam::Numeric(n.as_f64().unwrap_or(0.0)));
            Ok(format!("({column})::numeric {op} ${}", params.len()))
        }
        Value::Bool(b) => {
            params.push(SqlParam::Bool(*b));
            Ok(format!("({column})::boolean {op} ${}", params.len()))
        }
        _ => {
            params.push(SqlParam::Text(value_as_text(value)));
            Ok(format!("{column} {op} ${}", params.len()))
        }
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_order(entity: &str, sort: &[SortKey]) -> Result<String, StoreError> {
    if sort.is_empty() {
        return Ok(String::new());
    }
    let parts: Result<Vec<String>, StoreError> = sort
        .iter()
        .map(|key| {
            let column = column_expr(entity, &key.field)?;
            Ok(format!("{column} {}", key.direction.as_sql()))
        })
        .collect();
    Ok(format!("ORDER BY {}", parts?.join(", ")))
}

fn render_limit(plan: &QueryPlan) -> String {
    match (plan.limit, plan.offset) {
        (Some(limit), Some(offset)) if offset > 0 => format!("LIMIT {limit} OFFSET {offset}"),
        (Some(limit), _) => format!("LIMIT {limit}"),
        (None, Some(offset)) if offset > 0 => format!("OFFSET {offset}"),
        _ => String::new(),
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(s) => query.bind(s),
            SqlParam::TextArray(items) => query.bind(items),
            SqlParam::Uuid(id) => query.bind(*id),
            SqlParam::Timestamp(ts) => query.bind(*ts),
            SqlParam::Numeric(n) => query.bind(*n),
            SqlParam::Bool(b) => query.bind(*b),
        };
    }
    query
}

fn row_to_record(entity: &str, row: &PgRow) -> Result<Record, StoreError> {
    let fields: Value = row.try_get("fields")?;
    let fields: Map<String, Value> = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Record {
        id: row.try_get("id")?,
        entity: entity.to_string(),
        tenant: row.try_get("tenant")?,
        status: row.try_get("status")?,
        fields,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}
