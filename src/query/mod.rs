pub mod list_query;
pub mod plan;

pub use list_query::ListQuery;
pub use plan::{Page, Predicate, QueryPlan, SortDirection, SortKey};
