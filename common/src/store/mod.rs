// Entity store abstraction
//
// The dispatcher talks to the yard's persistent store through a small
// filter/get/create/update surface over JSON records. Typed repositories in
// `repositories` convert records to and from the domain models.

pub mod memory;
pub mod postgres;
pub mod repositories;

#[cfg(any(test, feature = "test-util"))]
pub mod fault;

pub use memory::MemoryStore;
pub use postgres::PgEntityStore;
pub use repositories::{AppointmentRepository, AuditRepository, VehicleRepository, WorkItemRepository};

use crate::errors::StoreError;
use crate::models::EntityKind;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// A stored entity: a JSON object carrying at least `id` and `created_at`
pub type Record = serde_json::Map<String, Value>;

/// Field name holding the store-assigned identifier
pub const ID_FIELD: &str = "id";
/// Field name holding the store-assigned creation timestamp
pub const CREATED_AT_FIELD: &str = "created_at";

/// Conjunction of field-equality conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    conditions: Vec<(String, Value)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Whether every condition holds for the record
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }

    /// Criteria as a JSON object, suitable for a JSONB containment query
    pub fn to_json(&self) -> Value {
        Value::Object(self.conditions.iter().cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordering applied to filter results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Most recently created records first
    pub fn newest_first() -> Self {
        Self::new(CREATED_AT_FIELD, SortDirection::Descending)
    }

    /// Compare two records on the sort field, honouring the direction.
    /// Records missing the field sort last in either direction.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        match (a.get(&self.field), b.get(&self.field)) {
            (Some(x), Some(y)) if !x.is_null() && !y.is_null() => {
                let ord = compare_values(x, y);
                match self.direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            }
            (Some(x), _) if !x.is_null() => Ordering::Less,
            (_, Some(y)) if !y.is_null() => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Generic CRUD/filter API over the yard's entity collections
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Records of `entity` matching `criteria`, ordered by `sort`, at most `limit`
    async fn filter(
        &self,
        entity: EntityKind,
        criteria: &Criteria,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// A single record by id, or `None` when absent
    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, StoreError>;

    /// Insert a record; the store assigns `id` (unless provided) and `created_at`
    async fn create(&self, entity: EntityKind, fields: Record) -> Result<Record, StoreError>;

    /// Merge `fields` into an existing record and return the result
    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        fields: Record,
    ) -> Result<Record, StoreError>;
}

/// Serialize a model into a record, dropping nulls the store would not keep
pub fn to_record<T: Serialize>(entity: EntityKind, value: &T) -> Result<Record, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::InvalidRecord {
            entity,
            reason: format!("expected an object, got {}", other),
        }),
        Err(e) => Err(StoreError::InvalidRecord {
            entity,
            reason: e.to_string(),
        }),
    }
}

/// Deserialize a record into a model
pub fn from_record<T: DeserializeOwned>(entity: EntityKind, record: Record) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(record)).map_err(|e| StoreError::InvalidRecord {
        entity,
        reason: e.to_string(),
    })
}

/// The string id of a record
pub fn record_id(entity: EntityKind, record: &Record) -> Result<String, StoreError> {
    record
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidRecord {
            entity,
            reason: "record has no string id".to_string(),
        })
}

/// Build a record from literal key/value pairs
#[macro_export]
macro_rules! record {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = $crate::store::Record::new();
        $(map.insert(($key).to_string(), ::serde_json::json!($value));)*
        map
    }};
}
