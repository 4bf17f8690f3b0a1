use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single predicate in a query plan. Field names refer either to fixed
/// engine columns (`id`, `tenant`, `status`, timestamps) or to keys inside
/// the record's dynamic field map; the storage backend decides how each is
/// addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Predicate {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    Between { field: String, low: Value, high: Value },
    In { field: String, values: Vec<Value> },

    /// Case-insensitive substring match against any of the named fields.
    Search { fields: Vec<String>, term: String },

    /// The row's `link_field` holds the id of a row in `entity` that
    /// matches every inner predicate ("has a biller whose name matches").
    Related {
        entity: String,
        link_field: String,
        predicates: Vec<Predicate>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Backend-agnostic query plan. Both storage backends consume this; only
/// they know how it maps onto SQL or an in-memory scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    pub predicates: Vec<Predicate>,
    pub sort: Vec<SortKey>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
    /// Soft-deleted rows are excluded unless this is set (cascade deletion
    /// and restore need to see them).
    pub include_deleted: bool,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, predicate: Predicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    /// The same plan without pagination, for total-count queries.
    pub fn unpaged(&self) -> QueryPlan {
        QueryPlan {
            predicates: self.predicates.clone(),
            sort: vec![],
            limit: None,
            offset: None,
            include_deleted: self.include_deleted,
        }
    }
}

/// One page of results plus the metadata callers need to render paging
/// controls.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub page_size: u32,
    pub total_pages: u64,
    pub last_page: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, page_size: u32) -> Self {
        let total_pages = if total == 0 {
            1
        } else {
            (total + page_size as u64 - 1) / page_size as u64
        };
        Self {
            items,
            total,
            page,
            page_size,
            last_page: page >= total_pages,
            total_pages,
        }
    }
}
