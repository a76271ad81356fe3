// Typed repositories over the entity store
// One repository per collection the dispatcher reads or writes

use super::{from_record, record_id, to_record, Criteria, EntityStore, Record, SortSpec};
use crate::errors::StoreError;
use crate::models::{
    Appointment, AppointmentStatus, AuditEntry, EntityKind, VehicleStatus, WorkItem,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{instrument, warn};

/// Repository for appointment reads and the dispatch transition
#[derive(Clone)]
pub struct AppointmentRepository {
    store: Arc<dyn EntityStore>,
}

impl AppointmentRepository {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Scheduled appointments, newest first, at most `limit`
    ///
    /// Records that cannot be decoded are skipped with a warning: they can
    /// never be due, and one bad row must not hide the others.
    #[instrument(skip(self))]
    pub async fn find_scheduled(&self, limit: usize) -> Result<Vec<Appointment>, StoreError> {
        let criteria = Criteria::new().eq("status", AppointmentStatus::Scheduled.as_str());
        let records = self
            .store
            .filter(
                EntityKind::Appointment,
                &criteria,
                &SortSpec::newest_first(),
                limit,
            )
            .await?;

        let mut appointments = Vec::with_capacity(records.len());
        for record in records {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<missing>")
                .to_string();
            match from_record::<Appointment>(EntityKind::Appointment, record) {
                Ok(appointment) => appointments.push(appointment),
                Err(e) => warn!(appointment_id = %id, error = %e, "Skipping undecodable appointment"),
            }
        }
        Ok(appointments)
    }

    /// Current persisted state of an appointment
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        match self.store.get(EntityKind::Appointment, id).await? {
            Some(record) => Ok(Some(from_record(EntityKind::Appointment, record)?)),
            None => Ok(None),
        }
    }

    /// Record that an appointment has fired and link its work item
    #[instrument(skip(self))]
    pub async fn mark_in_service(
        &self,
        id: &str,
        dispatched_at: DateTime<Utc>,
        work_item_id: &str,
    ) -> Result<Appointment, StoreError> {
        let mut fields = Record::new();
        fields.insert(
            "status".to_string(),
            json!(AppointmentStatus::InService.as_str()),
        );
        fields.insert("dispatched_at".to_string(), json!(dispatched_at));
        fields.insert("linked_task_id".to_string(), json!(work_item_id));

        let record = self
            .store
            .update(EntityKind::Appointment, id, fields)
            .await?;
        from_record(EntityKind::Appointment, record)
    }
}

/// Repository for work items created by the dispatcher
#[derive(Clone)]
pub struct WorkItemRepository {
    store: Arc<dyn EntityStore>,
}

impl WorkItemRepository {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Create a work item and return it with its store-assigned id
    #[instrument(skip(self, item), fields(title = %item.title))]
    pub async fn create(&self, item: &WorkItem) -> Result<WorkItem, StoreError> {
        let mut fields = to_record(EntityKind::WorkItem, item)?;
        fields.remove("id");
        let record = self.store.create(EntityKind::WorkItem, fields).await?;
        from_record(EntityKind::WorkItem, record)
    }

    /// A work item previously created for the given appointment, if any
    #[instrument(skip(self))]
    pub async fn find_by_source_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Option<WorkItem>, StoreError> {
        let criteria = Criteria::new().eq("source_appointment_id", appointment_id);
        let mut records = self
            .store
            .filter(EntityKind::WorkItem, &criteria, &SortSpec::newest_first(), 1)
            .await?;
        match records.pop() {
            Some(record) => Ok(Some(from_record(EntityKind::WorkItem, record)?)),
            None => Ok(None),
        }
    }
}

/// Repository for the vehicle status field owned by the fleet subsystem
#[derive(Clone)]
pub struct VehicleRepository {
    store: Arc<dyn EntityStore>,
}

impl VehicleRepository {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn set_status(&self, id: &str, status: VehicleStatus) -> Result<(), StoreError> {
        let mut fields = Record::new();
        fields.insert("status".to_string(), json!(status));
        let record = self.store.update(EntityKind::Vehicle, id, fields).await?;
        record_id(EntityKind::Vehicle, &record)?;
        Ok(())
    }
}

/// Append-only audit log
#[derive(Clone)]
pub struct AuditRepository {
    store: Arc<dyn EntityStore>,
}

impl AuditRepository {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, entry), fields(action = %entry.action, entity_id = %entry.entity_id))]
    pub async fn append(&self, entry: &AuditEntry) -> Result<String, StoreError> {
        let fields = to_record(EntityKind::AuditLog, entry)?;
        let record = self.store.create(EntityKind::AuditLog, fields).await?;
        record_id(EntityKind::AuditLog, &record)
    }
}
