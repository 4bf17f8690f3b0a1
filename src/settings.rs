//! Typed per-tenant settings. Each domain declares a settings struct and a
//! section name; serialization happens at this boundary only, so callers
//! never touch a raw key-value bag or hand-merge defaults.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::TENANT_SETTINGS;
use crate::error::EngineError;
use crate::query::{Predicate, QueryPlan};
use crate::record::Record;
use crate::scope::TenantScope;

impl<'e> TenantScope<'e> {
    /// Load the tenant's settings for a section, or the struct's defaults
    /// when nothing has been saved yet.
    pub async fn load_settings<T>(&self, section: &str) -> Result<T, EngineError>
    where
        T: DeserializeOwned + Default,
    {
        check_section(section)?;
        let mut plan = self.settings_plan(section);
        plan.limit = Some(1);
        let mut rows = self.engine.store.query(TENANT_SETTINGS, &plan).await?;
        match rows.pop() {
            Some(record) => {
                let value = record.field("value").cloned().unwrap_or(Value::Null);
                serde_json::from_value(value).map_err(|e| {
                    EngineError::validation(format!("stored settings for '{section}' no longer deserialize: {e}"))
                })
            }
            None => Ok(T::default()),
        }
    }

    /// Upsert the tenant's settings for a section.
    pub async fn save_settings<T>(&self, section: &str, settings: &T) -> Result<(), EngineError>
    where
        T: Serialize,
    {
        check_section(section)?;
        let value = serde_json::to_value(settings)
            .map_err(|e| EngineError::validation(format!("settings do not serialize: {e}")))?;

        let now = self.engine.clock.now();
        let mut txn = self.engine.store.begin().await?;
        let mut rows = txn.query(TENANT_SETTINGS, &self.settings_plan(section)).await?;
        match rows.pop() {
            Some(mut record) => {
                record.set_field("value", value);
                record.updated_at = now;
                txn.update(&record).await?;
            }
            None => {
                let mut fields = Map::new();
                fields.insert("section".to_string(), Value::String(section.to_string()));
                fields.insert("value".to_string(), value);
                let record = Record {
                    id: Uuid::new_v4(),
                    entity: TENANT_SETTINGS.to_string(),
                    tenant: self.tenant.clone(),
                    status: None,
                    fields,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                txn.insert(&record).await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    fn settings_plan(&self, section: &str) -> QueryPlan {
        let mut plan = QueryPlan::new();
        plan.push(Predicate::Eq {
            field: "tenant".into(),
            value: Value::String(self.tenant.clone()),
        });
        plan.push(Predicate::Eq {
            field: "section".into(),
            value: Value::String(section.to_string()),
        });
        plan
    }
}

fn check_section(section: &str) -> Result<(), EngineError> {
    if section.trim().is_empty() {
        return Err(EngineError::validation("settings section must not be empty"));
    }
    Ok(())
}
