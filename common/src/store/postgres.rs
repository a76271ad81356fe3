// PostgreSQL entity store
//
// All collections share the `entities` table; the record itself lives in a
// JSONB column so criteria become a containment (`@>`) query.

use super::{Criteria, EntityStore, Record, SortDirection, SortSpec, CREATED_AT_FIELD, ID_FIELD};
use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::EntityKind;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Entity store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: DbPool,
}

impl PgEntityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn decode(entity: EntityKind, value: Value) -> Result<Record, StoreError> {
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::InvalidRecord {
                entity,
                reason: format!("stored data is not an object: {}", other),
            }),
        }
    }
}

fn order_clause(sort: &SortSpec) -> String {
    let direction = match sort.direction {
        SortDirection::Ascending => "ASC",
        SortDirection::Descending => "DESC",
    };
    if sort.field == CREATED_AT_FIELD {
        format!("ORDER BY created_at {direction}")
    } else {
        format!("ORDER BY data -> $4 {direction} NULLS LAST, created_at {direction}")
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    #[instrument(skip(self, criteria, sort), fields(entity = %entity))]
    async fn filter(
        &self,
        entity: EntityKind,
        criteria: &Criteria,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT data FROM entities WHERE kind = $1 AND data @> $2 {} LIMIT $3",
            order_clause(sort)
        );

        let mut query = sqlx::query(&sql)
            .bind(entity.as_str())
            .bind(criteria.to_json())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        if sort.field != CREATED_AT_FIELD {
            query = query.bind(sort.field.as_str());
        }

        let rows = query.fetch_all(self.pool.pool()).await?;
        let records = rows
            .into_iter()
            .map(|row| {
                let data: Value = row.try_get("data")?;
                Self::decode(entity, data)
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        debug!(count = records.len(), "Filtered records");
        Ok(records)
    }

    #[instrument(skip(self), fields(entity = %entity))]
    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT data FROM entities WHERE kind = $1 AND id = $2")
            .bind(entity.as_str())
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                Ok(Some(Self::decode(entity, data)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, fields), fields(entity = %entity))]
    async fn create(&self, entity: EntityKind, mut fields: Record) -> Result<Record, StoreError> {
        let id = match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        let created_at = fields
            .get(CREATED_AT_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        fields.insert(
            CREATED_AT_FIELD.to_string(),
            Value::String(created_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );

        let row = sqlx::query(
            r#"
            INSERT INTO entities (kind, id, data, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING data
            "#,
        )
        .bind(entity.as_str())
        .bind(&id)
        .bind(Value::Object(fields))
        .bind(created_at)
        .fetch_one(self.pool.pool())
        .await?;

        let data: Value = row.try_get("data")?;
        debug!(id = %id, "Record created");
        Self::decode(entity, data)
    }

    #[instrument(skip(self, fields), fields(entity = %entity))]
    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        mut fields: Record,
    ) -> Result<Record, StoreError> {
        fields.remove(ID_FIELD);

        let row = sqlx::query(
            r#"
            UPDATE entities
            SET data = data || $3
            WHERE kind = $1 AND id = $2
            RETURNING data
            "#,
        )
        .bind(entity.as_str())
        .bind(id)
        .bind(Value::Object(fields))
        .fetch_optional(self.pool.pool())
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity,
            id: id.to_string(),
        })?;

        let data: Value = row.try_get("data")?;
        debug!(id = %id, "Record updated");
        Self::decode(entity, data)
    }
}
