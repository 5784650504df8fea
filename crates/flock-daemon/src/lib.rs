//! Flock Daemon Library
//!
//! Runtime for supervising Claude CLI workers:
//! - Per-worker process supervision and the stream-json input protocol
//! - Scheduling of project agents under a concurrency bound
//! - Orphan process tracking and per-key write serialization
//! - Collaborator contracts for project, conversation and settings storage

pub mod orchestration;
pub mod store;
pub mod subprocess;
