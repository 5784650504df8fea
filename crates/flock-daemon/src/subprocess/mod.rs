//! Supervision of Claude CLI worker processes.

pub mod args;
pub mod kill;
pub mod supervisor;

pub use args::PermissionArgs;
pub use kill::{
    KillError, KillSignal, is_process_alive, kill_process, kill_tree, signal_process,
};
pub use supervisor::{
    AgentConfig, AgentEvent, AgentMode, AgentProcess, AgentStatus, ImageAttachment,
    InputDisposition, ProcessError, WorkerSnapshot,
};
