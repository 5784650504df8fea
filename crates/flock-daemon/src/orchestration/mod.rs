//! Agent orchestration: scheduler, process tracker and write serializer.
//!
//! - [`AgentScheduler`]: admission control, queueing, session recovery and
//!   event fan-out for project and one-off agents.
//! - [`ProcessTracker`]: pid bookkeeping that outlives supervisor objects,
//!   used to reap orphans after a crash.
//! - [`WriteSerializer`]: per-key ordered execution of persistence writes.

pub mod scheduler;
pub mod serializer;
pub mod tracker;

pub use scheduler::{
    AgentScheduler, InteractiveOptions, OneOffRequest, OneOffSnapshot, QueueEntry, SchedulerDeps,
    SchedulerError, SchedulerEvent, SchedulerSnapshot, StartOutcome, is_valid_session_id,
};
pub use serializer::WriteSerializer;
pub use tracker::{CleanupReport, ProcessTracker};
