// Scheduler driver and its auth-gated supervisor

pub mod engine;
pub mod supervisor;

pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine, TickOutcome, TickReport};
pub use supervisor::SchedulerSupervisor;
