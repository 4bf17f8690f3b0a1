use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{config, EngineConfig};
use crate::entity::{EntityDef, EntityRegistry};
use crate::error::EngineError;
use crate::scope::TenantScope;
use crate::store::Datastore;

/// Root of the resource engine: a storage backend, a clock, the entity
/// registry, and tuning config. Domain controllers get a [`TenantScope`]
/// per request and never talk to storage directly.
pub struct Engine {
    pub(crate) store: Arc<dyn Datastore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: EntityRegistry,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Build with the process-wide config and the system clock.
    pub fn new(store: Arc<dyn Datastore>, registry: EntityRegistry) -> Result<Self, EngineError> {
        Self::with_parts(store, registry, config().clone(), Arc::new(SystemClock))
    }

    /// Fully explicit construction; tests inject a fixed clock and custom
    /// config here.
    pub fn with_parts(
        store: Arc<dyn Datastore>,
        registry: EntityRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        registry.validate()?;
        Ok(Self { store, clock, registry, config })
    }

    /// Every read issued through the returned scope is filtered by this
    /// tenant key and every create is stamped with it. There is no
    /// unscoped data path.
    pub fn scope(&self, tenant: impl Into<String>) -> TenantScope<'_> {
        TenantScope { engine: self, tenant: tenant.into() }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn entity_def(&self, entity: &str) -> Result<&EntityDef, EngineError> {
        self.registry
            .get(entity)
            .ok_or_else(|| EngineError::validation(format!("unknown entity type: '{entity}'")))
    }
}
