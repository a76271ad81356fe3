// In-memory entity store
//
// Keeps every collection in insertion order behind a tokio RwLock. Used by the
// `memory` store backend and throughout the test suites.

use super::{record_id, Criteria, EntityStore, Record, SortDirection, SortSpec, CREATED_AT_FIELD, ID_FIELD};
use crate::errors::StoreError;
use crate::models::EntityKind;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Entity store held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<EntityKind, Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of a collection, in insertion order
    pub async fn all(&self, entity: EntityKind) -> Vec<Record> {
        self.collections
            .read()
            .await
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records in a collection
    pub async fn count(&self, entity: EntityKind) -> usize {
        self.collections
            .read()
            .await
            .get(&entity)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    #[instrument(skip(self, criteria, sort), fields(entity = %entity))]
    async fn filter(
        &self,
        entity: EntityKind,
        criteria: &Criteria,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let collections = self.collections.read().await;
        let Some(records) = collections.get(&entity) else {
            return Ok(Vec::new());
        };

        // Ties keep the most recently inserted record first when descending
        let mut matched: Vec<Record> = match sort.direction {
            SortDirection::Descending => records
                .iter()
                .rev()
                .filter(|r| criteria.matches(r))
                .cloned()
                .collect(),
            SortDirection::Ascending => records
                .iter()
                .filter(|r| criteria.matches(r))
                .cloned()
                .collect(),
        };
        matched.sort_by(|a, b| sort.compare(a, b));
        matched.truncate(limit);

        debug!(count = matched.len(), "Filtered records");
        Ok(matched)
    }

    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(&entity).and_then(|records| {
            records
                .iter()
                .find(|r| r.get(ID_FIELD).and_then(Value::as_str) == Some(id))
                .cloned()
        }))
    }

    #[instrument(skip(self, fields), fields(entity = %entity))]
    async fn create(&self, entity: EntityKind, mut fields: Record) -> Result<Record, StoreError> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(entity).or_default();

        let id = match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        if records
            .iter()
            .any(|r| r.get(ID_FIELD).and_then(Value::as_str) == Some(id.as_str()))
        {
            return Err(StoreError::QueryFailed(format!(
                "duplicate {} id: {}",
                entity, id
            )));
        }

        fields.insert(ID_FIELD.to_string(), Value::String(id));
        if !fields.get(CREATED_AT_FIELD).is_some_and(|v| !v.is_null()) {
            fields.insert(
                CREATED_AT_FIELD.to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }

        records.push(fields.clone());
        debug!(id = %record_id(entity, &fields)?, "Record created");
        Ok(fields)
    }

    #[instrument(skip(self, fields), fields(entity = %entity))]
    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        fields: Record,
    ) -> Result<Record, StoreError> {
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(&entity)
            .and_then(|records| {
                records
                    .iter_mut()
                    .find(|r| r.get(ID_FIELD).and_then(Value::as_str) == Some(id))
            })
            .ok_or_else(|| StoreError::NotFound {
                entity,
                id: id.to_string(),
            })?;

        for (key, value) in fields {
            if key != ID_FIELD {
                record.insert(key, value);
            }
        }

        debug!(id = %id, "Record updated");
        Ok(record.clone())
    }
}
