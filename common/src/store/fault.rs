// Fault-injecting store decorator for tests
//
// Wraps another store, records every call in order, and fails calls that
// match configured rules. Optional latency makes overlapping ticks observable.

use super::{Criteria, EntityStore, Record, SortSpec, ID_FIELD};
use crate::errors::StoreError;
use crate::models::EntityKind;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Filter,
    Get,
    Create,
    Update,
}

/// One observed store call
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub entity: EntityKind,
    /// Target id for get/update; the created id for successful creates
    pub id: Option<String>,
    pub fields: Option<Record>,
}

/// Fail calls of `op` on `entity`, optionally only when a field matches
#[derive(Debug, Clone)]
pub struct FaultRule {
    op: StoreOp,
    entity: EntityKind,
    field: Option<(String, Value)>,
    remaining: Option<usize>,
}

impl FaultRule {
    pub fn new(op: StoreOp, entity: EntityKind) -> Self {
        Self {
            op,
            entity,
            field: None,
            remaining: None,
        }
    }

    /// Only match calls whose fields (or target id, as `id`) contain `field = value`
    pub fn when_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.field = Some((field.into(), value.into()));
        self
    }

    /// Stop failing after `n` matches
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: StoreOp, entity: EntityKind, subject: &Record) -> bool {
        if self.op != op || self.entity != entity || self.remaining == Some(0) {
            return false;
        }
        match &self.field {
            Some((field, value)) => subject.get(field) == Some(value),
            None => true,
        }
    }
}

/// Store decorator that injects failures and records calls
pub struct FaultyStore {
    inner: Arc<dyn EntityStore>,
    rules: Mutex<Vec<FaultRule>>,
    calls: Mutex<Vec<StoreCall>>,
    latency: Option<Duration>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn EntityStore>) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail(&self, rule: FaultRule) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(rule);
    }

    pub fn clear_faults(&self) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Calls observed so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls of one operation on one collection, in order
    pub fn calls_for(&self, op: StoreOp, entity: EntityKind) -> Vec<StoreCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op && c.entity == entity)
            .collect()
    }

    fn record_call(&self, call: StoreCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn check(&self, op: StoreOp, entity: EntityKind, subject: &Record) -> Result<(), StoreError> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rule) = rules.iter_mut().find(|r| r.matches(op, entity, subject)) {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return Err(StoreError::Unavailable(format!(
                "injected {:?} failure on {}",
                op, entity
            )));
        }
        Ok(())
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn with_id(id: &str, fields: Option<&Record>) -> Record {
    let mut subject = fields.cloned().unwrap_or_default();
    subject.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    subject
}

#[async_trait]
impl EntityStore for FaultyStore {
    async fn filter(
        &self,
        entity: EntityKind,
        criteria: &Criteria,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.record_call(StoreCall {
            op: StoreOp::Filter,
            entity,
            id: None,
            fields: None,
        });
        self.pause().await;
        let subject = match criteria.to_json() {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        self.check(StoreOp::Filter, entity, &subject)?;
        self.inner.filter(entity, criteria, sort, limit).await
    }

    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, StoreError> {
        self.record_call(StoreCall {
            op: StoreOp::Get,
            entity,
            id: Some(id.to_string()),
            fields: None,
        });
        self.pause().await;
        self.check(StoreOp::Get, entity, &with_id(id, None))?;
        self.inner.get(entity, id).await
    }

    async fn create(&self, entity: EntityKind, fields: Record) -> Result<Record, StoreError> {
        self.pause().await;
        if let Err(e) = self.check(StoreOp::Create, entity, &fields) {
            self.record_call(StoreCall {
                op: StoreOp::Create,
                entity,
                id: None,
                fields: Some(fields),
            });
            return Err(e);
        }
        let created = self.inner.create(entity, fields.clone()).await?;
        self.record_call(StoreCall {
            op: StoreOp::Create,
            entity,
            id: created.get(ID_FIELD).and_then(Value::as_str).map(str::to_string),
            fields: Some(fields),
        });
        Ok(created)
    }

    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        fields: Record,
    ) -> Result<Record, StoreError> {
        self.record_call(StoreCall {
            op: StoreOp::Update,
            entity,
            id: Some(id.to_string()),
            fields: Some(fields.clone()),
        });
        self.pause().await;
        self.check(StoreOp::Update, entity, &with_id(id, Some(&fields)))?;
        self.inner.update(entity, id, fields).await
    }
}
