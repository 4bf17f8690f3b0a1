use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::query::{SortDirection, SortKey};
use crate::record::is_system_column;
use crate::workflow::WorkflowDef;

/// Static declaration of one resource type: how it sorts, which fields are
/// searchable and mutable, and its status workflow if it has one.
#[derive(Debug, Clone)]
pub struct EntityDef {
    name: &'static str,
    default_sort: SortKey,
    sortable: Vec<&'static str>,
    searchable: Vec<&'static str>,
    mutable: Vec<&'static str>,
    workflow: Option<WorkflowDef>,
}

impl EntityDef {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            default_sort: SortKey {
                field: "created_at".to_string(),
                direction: SortDirection::Desc,
            },
            sortable: vec![],
            searchable: vec![],
            mutable: vec![],
            workflow: None,
        }
    }

    pub fn default_sort(mut self, field: &'static str, direction: SortDirection) -> Self {
        self.default_sort = SortKey { field: field.to_string(), direction };
        self
    }

    pub fn sortable(mut self, fields: &[&'static str]) -> Self {
        self.sortable = fields.to_vec();
        self
    }

    pub fn searchable(mut self, fields: &[&'static str]) -> Self {
        self.searchable = fields.to_vec();
        self
    }

    pub fn mutable(mut self, fields: &[&'static str]) -> Self {
        self.mutable = fields.to_vec();
        self
    }

    pub fn workflow(&self) -> Option<&WorkflowDef> {
        self.workflow.as_ref()
    }

    pub fn with_workflow(mut self, workflow: WorkflowDef) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_sort_key(&self) -> &SortKey {
        &self.default_sort
    }

    /// System columns are always sortable; dynamic fields only when
    /// whitelisted.
    pub fn is_sortable(&self, field: &str) -> bool {
        is_system_column(field) || self.sortable.contains(&field)
    }

    pub fn searchable_fields(&self) -> &[&'static str] {
        &self.searchable
    }

    pub fn is_mutable(&self, field: &str) -> bool {
        self.mutable.contains(&field)
    }
}

/// All resource types the engine knows about. Built once at startup and
/// validated by [`crate::engine::Engine::new`].
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<&'static str, EntityDef>,
}

/// Reserved entity names used by the ledger and settings subsystems. They
/// are registered automatically so backends provision their storage.
pub const WALLETS: &str = "wallets";
pub const WALLET_TRANSACTIONS: &str = "wallet_transactions";
pub const TENANT_SETTINGS: &str = "tenant_settings";

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
            .register(EntityDef::new(WALLETS).default_sort("created_at", SortDirection::Asc))
            .register(
                EntityDef::new(WALLET_TRANSACTIONS).default_sort("created_at", SortDirection::Asc),
            )
            .register(EntityDef::new(TENANT_SETTINGS))
    }

    pub fn register(mut self, def: EntityDef) -> Self {
        self.entities.insert(def.name, def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entities.keys().copied()
    }

    /// Startup validation: entity and field names must be safe identifiers
    /// (they end up quoted in generated SQL), and workflow tables must not
    /// declare edges from a state the machine can never reach.
    pub fn validate(&self) -> Result<(), EngineError> {
        for def in self.entities.values() {
            if !is_valid_ident(def.name) {
                return Err(EngineError::validation(format!(
                    "invalid entity name: '{}'",
                    def.name
                )));
            }
            let mut field_names: Vec<&str> = vec![def.default_sort.field.as_str()];
            field_names.extend(def.sortable.iter().copied());
            field_names.extend(def.searchable.iter().copied());
            field_names.extend(def.mutable.iter().copied());
            for field in field_names {
                if !is_valid_ident(field) {
                    return Err(EngineError::field_validation(
                        format!("invalid field name on entity '{}'", def.name),
                        field.to_string(),
                        "field names may contain only letters, digits and underscores",
                    ));
                }
            }
            if let Some(workflow) = &def.workflow {
                let mut reachable: Vec<&str> = vec![workflow.initial()];
                let mut grew = true;
                while grew {
                    grew = false;
                    for t in workflow.transitions() {
                        if reachable.contains(&t.from) && !reachable.contains(&t.to) {
                            reachable.push(t.to);
                            grew = true;
                        }
                    }
                }
                for t in workflow.transitions() {
                    if !reachable.contains(&t.from) {
                        return Err(EngineError::validation(format!(
                            "workflow for '{}' declares an edge from unreachable state '{}'",
                            def.name, t.from
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Identifier rule shared by entity and field names: letters, digits and
/// underscores, not starting with a digit. Everything that passes can be
/// double-quoted into SQL safely.
pub fn is_valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowDef;

    #[test]
    fn ident_rules() {
        assert!(is_valid_ident("appointments"));
        assert!(is_valid_ident("_private"));
        assert!(!is_valid_ident("1st"));
        assert!(!is_valid_ident("drop table"));
        assert!(!is_valid_ident(""));
        assert!(!is_valid_ident("a;b"));
    }

    #[test]
    fn builtin_entities_present() {
        let registry = EntityRegistry::new();
        assert!(registry.get(WALLETS).is_some());
        assert!(registry.get(WALLET_TRANSACTIONS).is_some());
        assert!(registry.get(TENANT_SETTINGS).is_some());
    }

    #[test]
    fn unreachable_workflow_state_rejected() {
        let registry = EntityRegistry::new().register(
            EntityDef::new("orders").with_workflow(
                WorkflowDef::new("pending")
                    .allow("pending", "confirmed")
                    .allow("orphan", "pending"),
            ),
        );
        assert!(registry.validate().is_err());
    }

    #[test]
    fn system_columns_always_sortable() {
        let def = EntityDef::new("bills").sortable(&["due_date"]);
        assert!(def.is_sortable("created_at"));
        assert!(def.is_sortable("due_date"));
        assert!(!def.is_sortable("amount"));
    }
}
