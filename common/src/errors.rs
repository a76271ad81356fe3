// Error handling framework
// Store, dispatch, authorization and configuration errors

use crate::models::EntityKind;
use thiserror::Error;

/// Entity store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("Invalid record for {entity}: {reason}")]
    InvalidRecord { entity: EntityKind, reason: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a single appointment dispatch.
///
/// Only the fatal steps surface here. Best-effort steps are logged and
/// discarded by the dispatch action itself.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to load appointment {appointment_id}: {source}")]
    AppointmentLoad {
        appointment_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to create work item for appointment {appointment_id}: {source}")]
    WorkItemCreation {
        appointment_id: String,
        #[source]
        source: StoreError,
    },

    #[error(
        "Failed to mark appointment {appointment_id} in service (work item {work_item_id}): {source}"
    )]
    AppointmentUpdate {
        appointment_id: String,
        work_item_id: String,
        #[source]
        source: StoreError,
    },
}

impl DispatchError {
    /// Name of the dispatch step that failed, used as a metrics label
    pub fn step(&self) -> &'static str {
        match self {
            DispatchError::AppointmentLoad { .. } => "load_appointment",
            DispatchError::WorkItemCreation { .. } => "create_work_item",
            DispatchError::AppointmentUpdate { .. } => "update_appointment",
        }
    }
}

/// Authorization errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Actor is not authenticated")]
    NotAuthenticated,

    #[error("Insufficient permissions: role '{0}' may not run the scheduler")]
    InsufficientPermissions(String),
}

/// Configuration validation errors
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => StoreError::ConnectionFailed(err.to_string()),
            sqlx::Error::Database(db_err) => StoreError::QueryFailed(db_err.message().to_string()),
            _ => StoreError::DatabaseError(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}
