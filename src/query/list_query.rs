use serde_json::Value;

use crate::config::EngineConfig;
use crate::entity::EntityDef;

use super::plan::{Predicate, QueryPlan, SortDirection, SortKey};

/// Caller-facing query builder. Collects optional predicates, a search
/// term, sort and paging, then lowers to a [`QueryPlan`] against a
/// specific entity definition. Lowering is forgiving by contract: unknown
/// sort fields fall back to the entity default and a blank search term is
/// a no-op, never a zero-match filter.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    filters: Vec<Predicate>,
    search: Option<String>,
    sort: Option<(String, SortDirection)>,
    page: Option<u64>,
    page_size: Option<u32>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Predicate::Eq { field: field.into(), value: value.into() });
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Predicate::Ne { field: field.into(), value: value.into() });
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Predicate::Gte { field: field.into(), value: value.into() });
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Predicate::Lte { field: field.into(), value: value.into() });
        self
    }

    pub fn between(
        mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.filters.push(Predicate::Between {
            field: field.into(),
            low: low.into(),
            high: high.into(),
        });
        self
    }

    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Predicate::In { field: field.into(), values });
        self
    }

    /// Existence check on a related row: this entity's `link_field` holds
    /// the id of a row in `entity` matching the given predicates.
    pub fn related(
        mut self,
        entity: impl Into<String>,
        link_field: impl Into<String>,
        predicates: Vec<Predicate>,
    ) -> Self {
        self.filters.push(Predicate::Related {
            entity: entity.into(),
            link_field: link_field.into(),
            predicates,
        });
        self
    }

    /// Raw predicate escape hatch.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    /// Case-insensitive substring search across the entity's declared
    /// searchable fields.
    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    /// 1-based page number.
    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Lower to a plan for one entity. Pagination is resolved separately so
    /// the caller can also run the unpaged count query.
    pub(crate) fn resolve(&self, def: &EntityDef, config: &EngineConfig) -> ResolvedQuery {
        let mut plan = QueryPlan::new();
        plan.predicates = self.filters.clone();

        if let Some(term) = &self.search {
            let term = term.trim();
            if !term.is_empty() {
                let fields = def.searchable_fields();
                if fields.is_empty() {
                    tracing::debug!(entity = def.name(), "search ignored: no searchable fields declared");
                } else {
                    plan.push(Predicate::Search {
                        fields: fields.iter().map(|f| f.to_string()).collect(),
                        term: term.to_string(),
                    });
                }
            }
        }

        plan.sort = vec![match &self.sort {
            Some((field, direction)) if def.is_sortable(field) => {
                SortKey { field: field.clone(), direction: *direction }
            }
            Some((field, _)) => {
                tracing::debug!(entity = def.name(), field = %field, "unknown sort field, using default");
                def.default_sort_key().clone()
            }
            None => def.default_sort_key().clone(),
        }];

        let page = self.page.unwrap_or(1).max(1);
        let requested = self.page_size.unwrap_or(config.default_page_size);
        let page_size = if requested > config.max_page_size {
            tracing::warn!(
                requested,
                max = config.max_page_size,
                "page size exceeds ceiling, clamping"
            );
            config.max_page_size
        } else {
            requested.max(1)
        };

        plan.limit = Some(page_size);
        plan.offset = Some((page - 1) * page_size as u64);

        ResolvedQuery { plan, page, page_size }
    }

    /// Lower to a limit-only plan for "top N" reads; paging fields are
    /// ignored in this mode.
    pub(crate) fn resolve_top(&self, def: &EntityDef, config: &EngineConfig, n: u32) -> QueryPlan {
        let mut resolved = self.resolve(def, config);
        resolved.plan.limit = Some(n.min(config.max_page_size).max(1));
        resolved.plan.offset = None;
        resolved.plan
    }
}

pub(crate) struct ResolvedQuery {
    pub plan: QueryPlan,
    pub page: u64,
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDef;
    use crate::query::SortDirection;

    fn def() -> EntityDef {
        EntityDef::new("appointments")
            .default_sort("starts_at", SortDirection::Asc)
            .sortable(&["starts_at"])
            .searchable(&["patient_name", "notes"])
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn unknown_sort_falls_back_to_default() {
        let resolved = ListQuery::new()
            .sort("no_such_field", SortDirection::Desc)
            .resolve(&def(), &config());
        assert_eq!(resolved.plan.sort[0].field, "starts_at");
        assert_eq!(resolved.plan.sort[0].direction, SortDirection::Asc);
    }

    #[test]
    fn blank_search_is_noop() {
        let resolved = ListQuery::new().search("   ").resolve(&def(), &config());
        assert!(resolved.plan.predicates.is_empty());
    }

    #[test]
    fn search_targets_declared_fields() {
        let resolved = ListQuery::new().search("reyes").resolve(&def(), &config());
        match &resolved.plan.predicates[0] {
            Predicate::Search { fields, term } => {
                assert_eq!(fields, &["patient_name", "notes"]);
                assert_eq!(term, "reyes");
            }
            other => panic!("expected search predicate, got {other:?}"),
        }
    }

    #[test]
    fn page_size_clamped_to_ceiling() {
        let resolved = ListQuery::new().page_size(10_000).resolve(&def(), &config());
        assert_eq!(resolved.page_size, config().max_page_size);
        assert_eq!(resolved.plan.limit, Some(config().max_page_size));
    }

    #[test]
    fn offset_follows_page_number() {
        let resolved = ListQuery::new().page(3).page_size(20).resolve(&def(), &config());
        assert_eq!(resolved.plan.offset, Some(40));
        assert_eq!(resolved.page, 3);
    }

    #[test]
    fn page_zero_treated_as_first() {
        let resolved = ListQuery::new().page(0).resolve(&def(), &config());
        assert_eq!(resolved.page, 1);
        assert_eq!(resolved.plan.offset, Some(0));
    }
}
