use std::time::Instant;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::query::{ListQuery, Page, Predicate, QueryPlan};
use crate::record::{reject_system_fields, Record};

/// A data-access handle bound to one tenant key. Obtained from
/// [`Engine::scope`]; the tenant predicate and tenant stamping are applied
/// here, once, instead of per endpoint.
pub struct TenantScope<'e> {
    pub(crate) engine: &'e Engine,
    pub(crate) tenant: String,
}

impl<'e> TenantScope<'e> {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Create a record. The tenant key, id, timestamps and (when the
    /// entity has a workflow) the initial status are stamped by the
    /// engine; caller fields may not touch engine-owned columns.
    pub async fn create(
        &self,
        entity: &str,
        fields: Map<String, Value>,
    ) -> Result<Record, EngineError> {
        let def = self.engine.entity_def(entity)?;
        if self.tenant.trim().is_empty() {
            return Err(EngineError::validation("tenant key must not be empty"));
        }
        if let Err(field) = reject_system_fields(&fields) {
            return Err(EngineError::field_validation(
                "engine-owned fields cannot be set directly",
                field,
                "this field is set by the engine",
            ));
        }

        let now = self.engine.clock.now();
        let record = Record {
            id: Uuid::new_v4(),
            entity: entity.to_string(),
            tenant: self.tenant.clone(),
            status: def.workflow().map(|w| w.initial().to_string()),
            fields,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let mut txn = self.engine.store.begin().await?;
        txn.insert(&record).await?;
        txn.commit().await?;
        Ok(record)
    }

    /// Fetch by id. Rows owned by another tenant and soft-deleted rows
    /// both come back as `NotFound`.
    pub async fn get(&self, entity: &str, id: Uuid) -> Result<Record, EngineError> {
        self.engine.entity_def(entity)?;
        self.engine
            .store
            .get(entity, id)
            .await?
            .filter(|r| r.tenant == self.tenant && !r.is_deleted())
            .ok_or_else(|| EngineError::not_found(format!("{entity} {id}")))
    }

    /// Patch a record's domain fields. Only fields on the entity's mutable
    /// whitelist may change; the stored row is re-read inside the
    /// transaction before the write.
    pub async fn update(
        &self,
        entity: &str,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<Record, EngineError> {
        let def = self.engine.entity_def(entity)?;
        if let Err(field) = reject_system_fields(&patch) {
            return Err(EngineError::field_validation(
                "engine-owned fields cannot be set directly",
                field,
                "this field is set by the engine",
            ));
        }
        for field in patch.keys() {
            if !def.is_mutable(field) {
                return Err(EngineError::field_validation(
                    "field is not updatable",
                    field.clone(),
                    "not on the mutable whitelist for this entity",
                ));
            }
        }

        let mut txn = self.engine.store.begin().await?;
        let mut record = txn
            .get_for_update(entity, id)
            .await?
            .filter(|r| r.tenant == self.tenant && !r.is_deleted())
            .ok_or_else(|| EngineError::not_found(format!("{entity} {id}")))?;

        for (key, value) in patch {
            record.fields.insert(key, value);
        }
        record.updated_at = self.engine.clock.now();
        txn.update(&record).await?;
        txn.commit().await?;
        Ok(record)
    }

    /// Persist a locally modified record. The record must already belong
    /// to this scope; handing in a row owned by another tenant is
    /// `AccessDenied` regardless of what is stored.
    pub async fn save(&self, record: &Record) -> Result<Record, EngineError> {
        if record.tenant != self.tenant {
            tracing::warn!(
                entity = %record.entity,
                id = %record.id,
                "rejected save of record owned by another tenant"
            );
            return Err(EngineError::AccessDenied);
        }
        let def = self.engine.entity_def(&record.entity)?;
        let patch: Map<String, Value> = record
            .fields
            .iter()
            .filter(|(key, _)| def.is_mutable(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.update(&record.entity, record.id, patch).await
    }

    /// Hard delete.
    pub async fn delete(&self, entity: &str, id: Uuid) -> Result<(), EngineError> {
        self.engine.entity_def(entity)?;
        let mut txn = self.engine.store.begin().await?;
        txn.get_for_update(entity, id)
            .await?
            .filter(|r| r.tenant == self.tenant)
            .ok_or_else(|| EngineError::not_found(format!("{entity} {id}")))?;

        let mut plan = QueryPlan::new();
        plan.include_deleted = true;
        plan.push(Predicate::Eq { field: "id".into(), value: Value::String(id.to_string()) });
        txn.delete(entity, &plan).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Soft delete: the row stays but disappears from default reads.
    pub async fn trash(&self, entity: &str, id: Uuid) -> Result<Record, EngineError> {
        self.engine.entity_def(entity)?;
        let mut txn = self.engine.store.begin().await?;
        let mut record = txn
            .get_for_update(entity, id)
            .await?
            .filter(|r| r.tenant == self.tenant && !r.is_deleted())
            .ok_or_else(|| EngineError::not_found(format!("{entity} {id}")))?;

        let now = self.engine.clock.now();
        record.deleted_at = Some(now);
        record.updated_at = now;
        txn.update(&record).await?;
        txn.commit().await?;
        Ok(record)
    }

    /// Undo a soft delete. Restoring a live row is a no-op.
    pub async fn restore(&self, entity: &str, id: Uuid) -> Result<Record, EngineError> {
        self.engine.entity_def(entity)?;
        let mut txn = self.engine.store.begin().await?;
        let mut record = txn
            .get_for_update(entity, id)
            .await?
            .filter(|r| r.tenant == self.tenant)
            .ok_or_else(|| EngineError::not_found(format!("{entity} {id}")))?;

        if record.deleted_at.is_some() {
            record.deleted_at = None;
            record.updated_at = self.engine.clock.now();
            txn.update(&record).await?;
        }
        txn.commit().await?;
        Ok(record)
    }

    /// Paginated, filtered listing. Total count and page metadata come
    /// from an unpaged count over the same predicates.
    pub async fn list(&self, entity: &str, query: ListQuery) -> Result<Page<Record>, EngineError> {
        let def = self.engine.entity_def(entity)?;
        let mut resolved = query.resolve(def, &self.engine.config);
        self.scope_plan(&mut resolved.plan);

        let started = Instant::now();
        let total = self.engine.store.count(entity, &resolved.plan.unpaged()).await?;
        let items = self.engine.store.query(entity, &resolved.plan).await?;
        self.warn_if_slow(entity, started);

        Ok(Page::new(items, total, resolved.page, resolved.page_size))
    }

    /// Limit-only listing for "top N" reads (e.g. upcoming appointments);
    /// no count query, no page metadata.
    pub async fn top(
        &self,
        entity: &str,
        query: ListQuery,
        n: u32,
    ) -> Result<Vec<Record>, EngineError> {
        let def = self.engine.entity_def(entity)?;
        let mut plan = query.resolve_top(def, &self.engine.config, n);
        self.scope_plan(&mut plan);

        let started = Instant::now();
        let items = self.engine.store.query(entity, &plan).await?;
        self.warn_if_slow(entity, started);
        Ok(items)
    }

    /// The one place the tenant predicate is attached.
    fn scope_plan(&self, plan: &mut QueryPlan) {
        plan.predicates.insert(
            0,
            Predicate::Eq { field: "tenant".into(), value: Value::String(self.tenant.clone()) },
        );
    }

    fn warn_if_slow(&self, entity: &str, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.engine.config.slow_query_warn_ms {
            tracing::warn!(entity, elapsed_ms, "slow list query");
        }
    }
}
