// Dispatch action: fires one due appointment
//
// Steps run in a fixed order. Loading the appointment, creating the work item
// and marking the appointment in service are fatal; the duplicate lookup, the
// vehicle update and the audit entry are best-effort. Notification and
// invalidation happen only after the fatal steps have all succeeded.

use crate::clock::Clock;
use crate::errors::{DispatchError, StoreError};
use crate::fanout::FanOut;
use crate::models::{
    Appointment, AppointmentStatus, AuditEntry, CollectionTag, EntityKind, VehicleStatus,
    WorkItem, WorkItemPriority, WorkItemStatus,
};
use crate::store::{
    AppointmentRepository, AuditRepository, EntityStore, VehicleRepository, WorkItemRepository,
};
use crate::telemetry;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Audit action tag written for every dispatch
pub const AUDIT_ACTION_DISPATCHED: &str = "appointment_dispatched";

/// Whether a failing step aborts the dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    Fatal,
    BestEffort,
}

/// The side-effect steps of a dispatch, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStep {
    LoadAppointment,
    FindExistingWorkItem,
    CreateWorkItem,
    UpdateVehicle,
    UpdateAppointment,
    AppendAudit,
}

impl DispatchStep {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchStep::LoadAppointment => "load_appointment",
            DispatchStep::FindExistingWorkItem => "find_existing_work_item",
            DispatchStep::CreateWorkItem => "create_work_item",
            DispatchStep::UpdateVehicle => "update_vehicle",
            DispatchStep::UpdateAppointment => "update_appointment",
            DispatchStep::AppendAudit => "append_audit",
        }
    }

    pub fn policy(&self) -> StepPolicy {
        match self {
            DispatchStep::LoadAppointment
            | DispatchStep::CreateWorkItem
            | DispatchStep::UpdateAppointment => StepPolicy::Fatal,
            DispatchStep::FindExistingWorkItem
            | DispatchStep::UpdateVehicle
            | DispatchStep::AppendAudit => StepPolicy::BestEffort,
        }
    }
}

/// Why a dispatch did nothing
#[derive(Debug, Clone, PartialEq)]
pub enum NoOpReason {
    /// The persisted status is no longer `Scheduled`
    NotScheduled(AppointmentStatus),
    /// The appointment no longer exists in the store
    Missing,
}

/// Result of a dispatch attempt that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The appointment is now in service; carries the updated record
    Dispatched(Appointment),
    /// The idempotency gate rejected the appointment
    NoOp {
        appointment_id: String,
        reason: NoOpReason,
    },
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched(_))
    }
}

/// Title of the work item created for an appointment
pub fn work_item_title(appointment: &Appointment) -> String {
    format!(
        "{} agendada - {}",
        appointment.kind.label(),
        appointment.vehicle_plate
    )
}

/// Notice shown to operators after a dispatch
pub fn dispatch_notice(appointment: &Appointment) -> String {
    format!("Agendamento liberado: {}", appointment.display_label())
}

fn schedule_text(appointment: &Appointment) -> (&str, &str) {
    (
        appointment.date.as_deref().unwrap_or_default(),
        appointment.time.as_deref().unwrap_or_default(),
    )
}

/// Work item derived from an appointment
pub fn build_work_item(appointment: &Appointment) -> WorkItem {
    let (date, time) = schedule_text(appointment);
    WorkItem {
        id: String::new(),
        title: work_item_title(appointment),
        description: format!(
            "{} agendada para o veículo {} em {} às {}.",
            appointment.kind.label(),
            appointment.vehicle_plate,
            date,
            time
        ),
        category: appointment.kind.work_item_category(),
        priority: WorkItemPriority::Medium,
        status: WorkItemStatus::AwaitingAllocation,
        observations: format!(
            "Gerada automaticamente pelo agendamento {}",
            appointment.id
        ),
        source_appointment_id: Some(appointment.id.clone()),
        created_at: None,
    }
}

/// Converts due appointments into work items, exactly once per appointment
pub struct DispatchAction {
    appointments: AppointmentRepository,
    work_items: WorkItemRepository,
    vehicles: VehicleRepository,
    audit: AuditRepository,
    fanout: FanOut,
    clock: Arc<dyn Clock>,
}

impl DispatchAction {
    pub fn new(store: Arc<dyn EntityStore>, fanout: FanOut, clock: Arc<dyn Clock>) -> Self {
        Self {
            appointments: AppointmentRepository::new(store.clone()),
            work_items: WorkItemRepository::new(store.clone()),
            vehicles: VehicleRepository::new(store.clone()),
            audit: AuditRepository::new(store),
            fanout,
            clock,
        }
    }

    /// Dispatch one appointment
    ///
    /// The status is re-read from the store first, so a stale copy of an
    /// appointment that has already fired returns `NoOp` without side effects.
    #[instrument(skip(self, appointment), fields(appointment_id = %appointment.id, kind = appointment.kind.as_str()))]
    pub async fn dispatch(&self, appointment: &Appointment) -> Result<DispatchOutcome, DispatchError> {
        let current = match self.appointments.find_by_id(&appointment.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!("Appointment no longer exists, skipping");
                telemetry::record_dispatch_noop();
                return Ok(DispatchOutcome::NoOp {
                    appointment_id: appointment.id.clone(),
                    reason: NoOpReason::Missing,
                });
            }
            Err(source) => {
                return Err(self.fail(DispatchError::AppointmentLoad {
                    appointment_id: appointment.id.clone(),
                    source,
                }));
            }
        };

        if !current.is_dispatchable() {
            let status = current.status.unwrap_or(AppointmentStatus::Unknown);
            debug!(status = %status, "Appointment already advanced, skipping");
            telemetry::record_dispatch_noop();
            return Ok(DispatchOutcome::NoOp {
                appointment_id: current.id,
                reason: NoOpReason::NotScheduled(status),
            });
        }

        let work_item_id = self.ensure_work_item(&current).await?;

        if let Some(vehicle_id) = current.vehicle_id.as_deref() {
            let result = self.vehicles.set_status(vehicle_id, VehicleStatus::AtYard).await;
            if best_effort(DispatchStep::UpdateVehicle, &current.id, result).is_some() {
                debug!(vehicle_id = %vehicle_id, "Vehicle marked at yard");
            }
        }

        let dispatched_at = self.clock.now();
        let updated = self
            .appointments
            .mark_in_service(&current.id, dispatched_at, &work_item_id)
            .await
            .map_err(|source| {
                self.fail(DispatchError::AppointmentUpdate {
                    appointment_id: current.id.clone(),
                    work_item_id: work_item_id.clone(),
                    source,
                })
            })?;

        let (date, time) = schedule_text(&current);
        let entry = AuditEntry {
            action: AUDIT_ACTION_DISPATCHED.to_string(),
            entity_type: EntityKind::Appointment,
            entity_id: current.id.clone(),
            description: format!(
                "Agendamento liberado: {} ({} {})",
                current.display_label(),
                date,
                time
            ),
            created_at: dispatched_at,
        };
        best_effort(
            DispatchStep::AppendAudit,
            &current.id,
            self.audit.append(&entry).await,
        );

        self.fanout.notify(&dispatch_notice(&current));
        self.fanout.invalidate_all(&CollectionTag::DISPATCH_SET);

        telemetry::record_dispatched(current.kind.as_str());
        info!(
            work_item_id = %work_item_id,
            dispatched_at = %dispatched_at,
            "Appointment dispatched"
        );

        Ok(DispatchOutcome::Dispatched(updated))
    }

    /// Id of the work item to link, reusing one left by an earlier attempt
    /// whose appointment update did not land
    async fn ensure_work_item(&self, appointment: &Appointment) -> Result<String, DispatchError> {
        let existing = best_effort(
            DispatchStep::FindExistingWorkItem,
            &appointment.id,
            self.work_items
                .find_by_source_appointment(&appointment.id)
                .await,
        )
        .flatten();

        if let Some(item) = existing {
            info!(work_item_id = %item.id, "Reusing work item from an earlier attempt");
            return Ok(item.id);
        }

        let created = self
            .work_items
            .create(&build_work_item(appointment))
            .await
            .map_err(|source| {
                self.fail(DispatchError::WorkItemCreation {
                    appointment_id: appointment.id.clone(),
                    source,
                })
            })?;

        debug!(work_item_id = %created.id, "Work item created");
        Ok(created.id)
    }

    fn fail(&self, err: DispatchError) -> DispatchError {
        telemetry::record_dispatch_failure(err.step());
        err
    }
}

/// Settle a best-effort step: a failure is logged and discarded
fn best_effort<T>(step: DispatchStep, appointment_id: &str, result: Result<T, StoreError>) -> Option<T> {
    debug_assert_eq!(step.policy(), StepPolicy::BestEffort);
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                appointment_id = %appointment_id,
                step = step.name(),
                error = %e,
                "Best-effort dispatch step failed"
            );
            telemetry::record_dispatch_failure(step.name());
            None
        }
    }
}
