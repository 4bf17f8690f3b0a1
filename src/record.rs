use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Columns owned by the engine. They can only be written through engine
/// operations (create stamping, transitions, soft delete), never through
/// caller-supplied field maps.
pub const SYSTEM_COLUMNS: &[&str] = &[
    "id",
    "entity",
    "tenant",
    "status",
    "created_at",
    "updated_at",
    "deleted_at",
];

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.contains(&name)
}

/// A dynamic resource row: fixed engine-owned columns plus a free-form
/// domain payload. Side-effect timestamps (`cancelled_at`, `completed_at`,
/// ...) live in `fields` as RFC 3339 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    /// Entity type name, e.g. "appointments".
    pub entity: String,
    /// Owning tenant key. Set at creation, immutable thereafter.
    pub tenant: String,
    pub status: Option<String>,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; default reads exclude rows where this is set.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Parse a timestamp field stamped by a workflow side effect.
    pub fn timestamp_field(&self, name: &str) -> Option<DateTime<Utc>> {
        self.field_str(name)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Reject caller input that tries to smuggle in engine-owned columns.
/// Returns the offending field name on failure.
pub fn reject_system_fields(fields: &Map<String, Value>) -> Result<(), &str> {
    for key in fields.keys() {
        if let Some(col) = SYSTEM_COLUMNS.iter().find(|&&c| c == key) {
            return Err(*col);
        }
    }
    Ok(())
}
