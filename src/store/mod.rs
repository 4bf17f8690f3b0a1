pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::query::QueryPlan;
use crate::record::Record;

/// Errors from the storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Persistence collaborator: filtered/counted/keyed reads plus a
/// transactional unit of work. The engine composes everything else on top.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Record>, StoreError>;

    /// Count rows matching the plan's predicates. Limit and offset are
    /// ignored; this backs pagination totals.
    async fn count(&self, entity: &str, plan: &QueryPlan) -> Result<u64, StoreError>;

    /// Fetch by id with no tenant or soft-delete filtering; scoping is the
    /// engine's job.
    async fn get(&self, entity: &str, id: Uuid) -> Result<Option<Record>, StoreError>;
}

/// One transaction. All writes in a logical operation go through a single
/// instance; dropping it without committing rolls everything back.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn query(&mut self, entity: &str, plan: &QueryPlan) -> Result<Vec<Record>, StoreError>;

    /// Read one row, write-locked where the backend supports it, so
    /// precondition checks run against current state.
    async fn get_for_update(&mut self, entity: &str, id: Uuid)
        -> Result<Option<Record>, StoreError>;

    async fn insert(&mut self, record: &Record) -> Result<(), StoreError>;

    async fn update(&mut self, record: &Record) -> Result<(), StoreError>;

    /// Delete matching rows, returning how many were removed.
    async fn delete(&mut self, entity: &str, plan: &QueryPlan) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
