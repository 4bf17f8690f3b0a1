//! Cascading tenant deletion. Instead of hand-writing a parent lookup per
//! dependent table, callers declare the dependency graph once; the engine
//! walks it in one transaction and reports per-entity counts.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::query::{Predicate, QueryPlan};

/// An entity that references its parent through a link field instead of
/// carrying the tenant key as its ownership root (e.g. transactions owned
/// by a wallet owned by a contact).
#[derive(Debug, Clone)]
pub struct DependentRule {
    pub entity: &'static str,
    pub parent: &'static str,
    pub link_field: &'static str,
}

/// Declarative registry of everything a tenant owns.
#[derive(Debug, Clone, Default)]
pub struct DeletionRegistry {
    direct: Vec<&'static str>,
    dependent: Vec<DependentRule>,
}

impl DeletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity rows carrying the tenant key directly.
    pub fn direct(mut self, entity: &'static str) -> Self {
        self.direct.push(entity);
        self
    }

    /// Entity rows reached by following `link_field` to a parent entity
    /// that is itself registered (directly or through another rule).
    pub fn dependent(
        mut self,
        entity: &'static str,
        parent: &'static str,
        link_field: &'static str,
    ) -> Self {
        self.dependent.push(DependentRule { entity, parent, link_field });
        self
    }

    /// Misconfiguration is caught before any row is touched: unknown
    /// entities, duplicate rules, and dependent chains that never reach a
    /// direct entity.
    fn validate(&self, engine: &Engine) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for entity in self.direct.iter().chain(self.dependent.iter().map(|r| &r.entity)) {
            engine.entity_def(entity)?;
            if !seen.insert(*entity) {
                return Err(EngineError::validation(format!(
                    "entity '{entity}' is registered twice for deletion"
                )));
            }
        }

        let mut reachable: HashSet<&str> = self.direct.iter().copied().collect();
        let mut grew = true;
        while grew {
            grew = false;
            for rule in &self.dependent {
                if reachable.contains(rule.parent) && reachable.insert(rule.entity) {
                    grew = true;
                }
            }
        }
        for rule in &self.dependent {
            if !reachable.contains(rule.entity) {
                return Err(EngineError::validation(format!(
                    "dependent entity '{}' never reaches a direct entity via parent '{}'",
                    rule.entity, rule.parent
                )));
            }
        }
        Ok(())
    }
}

/// Per-entity counts of rows removed. Every registered entity appears,
/// zeros included. Transient; nothing persists this.
#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    counts: BTreeMap<String, u64>,
}

impl DeletionReport {
    pub fn removed(&self, entity: &str) -> u64 {
        self.counts.get(entity).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }
}

impl Engine {
    /// Delete every row the tenant owns across the registered dependency
    /// graph: direct entities first, then dependents in waves following
    /// their declared parent links. One transaction; a failure on the
    /// thirtieth table leaves the first twenty-nine intact.
    pub async fn delete_tenant(
        &self,
        tenant: &str,
        registry: &DeletionRegistry,
    ) -> Result<DeletionReport, EngineError> {
        registry.validate(self)?;

        let mut txn = self.store.begin().await?;
        let mut report = DeletionReport::default();
        // Ids per deleted entity, kept so children can follow their parent
        // links after the parents are gone.
        let mut deleted_ids: HashMap<&str, Vec<Uuid>> = HashMap::new();

        for entity in &registry.direct {
            let mut plan = QueryPlan::new();
            plan.include_deleted = true;
            plan.push(Predicate::Eq {
                field: "tenant".into(),
                value: Value::String(tenant.to_string()),
            });

            let rows = txn.query(entity, &plan).await?;
            deleted_ids.insert(*entity, rows.iter().map(|r| r.id).collect());
            let removed = txn.delete(entity, &plan).await?;
            report.counts.insert(entity.to_string(), removed);
        }

        let mut pending: Vec<&DependentRule> = registry.dependent.iter().collect();
        while !pending.is_empty() {
            let mut remaining = vec![];
            let mut progressed = false;
            for rule in pending {
                let Some(parent_ids) = deleted_ids.get(rule.parent) else {
                    remaining.push(rule);
                    continue;
                };
                progressed = true;

                if parent_ids.is_empty() {
                    deleted_ids.insert(rule.entity, vec![]);
                    report.counts.insert(rule.entity.to_string(), 0);
                    continue;
                }

                let mut plan = QueryPlan::new();
                plan.include_deleted = true;
                plan.push(Predicate::In {
                    field: rule.link_field.to_string(),
                    values: parent_ids.iter().map(|id| Value::String(id.to_string())).collect(),
                });

                let rows = txn.query(rule.entity, &plan).await?;
                deleted_ids.insert(rule.entity, rows.iter().map(|r| r.id).collect());
                let removed = txn.delete(rule.entity, &plan).await?;
                report.counts.insert(rule.entity.to_string(), removed);
            }
            if !progressed {
                // validate() guarantees reachability, so this is a bug.
                return Err(EngineError::validation(
                    "deletion registry made no progress resolving dependents",
                ));
            }
            pending = remaining;
        }

        txn.commit().await?;
        tracing::info!(tenant, total = report.total(), "tenant data deleted");
        Ok(report)
    }
}
