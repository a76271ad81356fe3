// Yard appointment dispatch: shared library for the scheduler binary

pub mod auth;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod fanout;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;
