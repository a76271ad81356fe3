use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Store Collections
// ============================================================================

/// Logical entity collections held by the entity store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Appointment,
    WorkItem,
    Vehicle,
    AuditLog,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Appointment => "appointment",
            EntityKind::WorkItem => "work_item",
            EntityKind::Vehicle => "vehicle",
            EntityKind::AuditLog => "audit_log",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache keys observers use to re-fetch collections after a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionTag {
    Appointments,
    Vehicles,
    Tasks,
}

impl CollectionTag {
    /// Every collection touched by a successful dispatch, in signalling order
    pub const DISPATCH_SET: [CollectionTag; 3] = [
        CollectionTag::Appointments,
        CollectionTag::Vehicles,
        CollectionTag::Tasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionTag::Appointments => "appointments",
            CollectionTag::Vehicles => "vehicles",
            CollectionTag::Tasks => "tasks",
        }
    }
}

impl fmt::Display for CollectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Appointment Models
// ============================================================================

/// Appointment is a scheduled load/unload slot for a vehicle at the yard
///
/// `date` and `time` are kept as the raw strings entered upstream; a value
/// that does not parse makes the appointment never due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub vehicle_plate: String,
    pub kind: AppointmentKind,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub status: Option<AppointmentStatus>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub linked_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// AppointmentKind selects the yard operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentKind {
    Load,
    Unload,
}

impl AppointmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentKind::Load => "load",
            AppointmentKind::Unload => "unload",
        }
    }

    /// Operator-facing label
    pub fn label(&self) -> &'static str {
        match self {
            AppointmentKind::Load => "Carga",
            AppointmentKind::Unload => "Descarga",
        }
    }

    /// Work item category created for this kind of appointment
    pub fn work_item_category(&self) -> WorkItemCategory {
        match self {
            AppointmentKind::Load => WorkItemCategory::Loading,
            AppointmentKind::Unload => WorkItemCategory::Unloading,
        }
    }
}

/// AppointmentStatus tracks the appointment lifecycle
///
/// Only `Scheduled -> InService` is performed by the dispatcher.
/// Values written by other systems that are not recognised decode as
/// `Unknown` and are never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    InService,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::InService => "in_service",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Appointment {
    /// Label shown in notices, e.g. `Carga - ABC1D23`
    pub fn display_label(&self) -> String {
        format!("{} - {}", self.kind.label(), self.vehicle_plate)
    }

    /// Whether the recorded status lets the dispatcher act
    ///
    /// An absent status is treated as dispatchable; anything other than
    /// `Scheduled` is not.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.status, None | Some(AppointmentStatus::Scheduled))
    }
}

// ============================================================================
// Work Item Models
// ============================================================================

/// WorkItem is the operational task created when an appointment fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: WorkItemCategory,
    pub priority: WorkItemPriority,
    pub status: WorkItemStatus,
    pub observations: String,
    /// Structured back-reference used to detect an earlier, unlinked work item
    #[serde(default)]
    pub source_appointment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemCategory {
    Loading,
    Unloading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    AwaitingAllocation,
    Allocated,
    InProgress,
    Done,
}

// ============================================================================
// Vehicle & Audit Models
// ============================================================================

/// Vehicle status values the dispatcher writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Expected,
    AtYard,
    Departed,
}

/// AuditEntry is an append-only record of an automated action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}
