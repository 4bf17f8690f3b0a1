//! Status workflow engine: per-entity transition tables with side-effect
//! hooks. A transition is one transactional unit; the legality check runs
//! against the row as stored, re-read under a row lock, never against a
//! previously loaded copy.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EngineError;
use crate::record::Record;
use crate::scope::TenantScope;

/// Side effect attached to a transition edge.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Stamp `field = now()` only when the field is still unset. Re-applying
    /// an edge never overwrites an earlier stamp.
    StampOnce(&'static str),
    /// Copy a context value into a field when the caller supplied it
    /// (e.g. a cancellation reason).
    SetFromContext {
        key: &'static str,
        field: &'static str,
    },
    /// Unconditionally set a field to a fixed value.
    SetField { field: &'static str, value: Value },
    /// Set the status of the record referenced by `link_field`, in the same
    /// transaction (e.g. mark a courier available again once delivered).
    ReleaseRelated {
        entity: &'static str,
        link_field: &'static str,
        status: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: &'static str,
    pub to: &'static str,
    pub effects: Vec<Effect>,
}

/// Declared transition table for one entity type.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    initial: &'static str,
    transitions: Vec<Transition>,
}

impl WorkflowDef {
    pub fn new(initial: &'static str) -> Self {
        Self { initial, transitions: vec![] }
    }

    /// Declare a legal edge with no side effects.
    pub fn allow(self, from: &'static str, to: &'static str) -> Self {
        self.allow_with(from, to, vec![])
    }

    /// Declare a legal edge with side effects applied on traversal.
    pub fn allow_with(mut self, from: &'static str, to: &'static str, effects: Vec<Effect>) -> Self {
        self.transitions.push(Transition { from, to, effects });
        self
    }

    pub fn initial(&self) -> &'static str {
        self.initial
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }
}

/// Caller-supplied context for a transition, consumed by
/// [`Effect::SetFromContext`].
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    values: Map<String, Value>,
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Deferred related-row update produced by effect application; executed by
/// the scope inside the same transaction.
pub(crate) struct RelatedRelease {
    pub entity: &'static str,
    pub link_field: &'static str,
    pub status: &'static str,
}

/// Apply an edge's effects to the record in place. Related-row updates are
/// returned as directives so the caller can run them in-transaction.
pub(crate) fn apply_effects(
    record: &mut Record,
    effects: &[Effect],
    ctx: &TransitionContext,
    now: DateTime<Utc>,
) -> Vec<RelatedRelease> {
    let mut releases = vec![];
    for effect in effects {
        match effect {
            Effect::StampOnce(field) => {
                let already = record.field(field).map(|v| !v.is_null()).unwrap_or(false);
                if !already {
                    record.set_field(*field, now.to_rfc3339());
                }
            }
            Effect::SetFromContext { key, field } => {
                if let Some(value) = ctx.get(key) {
                    record.set_field(*field, value.clone());
                }
            }
            Effect::SetField { field, value } => {
                record.set_field(*field, value.clone());
            }
            Effect::ReleaseRelated { entity, link_field, status } => {
                releases.push(RelatedRelease { entity, link_field, status });
            }
        }
    }
    releases
}

impl<'e> TenantScope<'e> {
    /// Drive the entity's status machine. The status write, side effects,
    /// and related-row updates commit or roll back as one unit; an illegal
    /// target leaves the row untouched.
    pub async fn transition(
        &self,
        entity: &str,
        id: Uuid,
        target: &str,
        ctx: TransitionContext,
    ) -> Result<Record, EngineError> {
        let def = self.engine.entity_def(entity)?;
        let workflow = def.workflow().ok_or_else(|| {
            EngineError::validation(format!("entity '{entity}' has no status workflow"))
        })?;

        let mut txn = self.engine.store.begin().await?;

        let mut record = txn
            .get_for_update(entity, id)
            .await?
            .filter(|r| r.tenant == self.tenant && !r.is_deleted())
            .ok_or_else(|| EngineError::not_found(format!("{entity} {id}")))?;

        let current = record
            .status
            .clone()
            .unwrap_or_else(|| workflow.initial().to_string());

        let Some(edge) = workflow.edge(&current, target) else {
            tracing::debug!(entity, %id, from = %current, to = target, "transition rejected");
            return Err(EngineError::InvalidTransition {
                from: current,
                to: target.to_string(),
            });
        };

        let now = self.engine.clock.now();
        let releases = apply_effects(&mut record, &edge.effects, &ctx, now);
        record.status = Some(target.to_string());
        record.updated_at = now;
        txn.update(&record).await?;

        for release in releases {
            let Some(rel_id) = record
                .field_str(release.link_field)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                tracing::debug!(entity, %id, link = release.link_field, "no related row to release");
                continue;
            };
            if let Some(mut related) = txn.get_for_update(release.entity, rel_id).await? {
                if related.tenant == self.tenant {
                    related.status = Some(release.status.to_string());
                    related.updated_at = now;
                    txn.update(&related).await?;
                }
            }
        }

        txn.commit().await?;
        Ok(record)
    }
}
