//! Collaborator contracts consumed by the scheduler.
//!
//! Storage, settings and prompt policy live outside the daemon core. The
//! scheduler only sees these traits; [`memory`] and [`policy`] provide the
//! reference implementations used by the binary and the tests.

pub mod memory;
pub mod policy;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flock_core::config::Config;
use flock_core::ndjson::{ContextUsage, DomainMessage};

use crate::subprocess::{AgentStatus, PermissionArgs};

pub use memory::{MemoryConversationStore, MemoryProjectStore};
pub use policy::{ConfigSettings, DefaultInstructions, DefaultPermissionArgs};

/// Errors raised by collaborator stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A project the scheduler can run agents for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    /// Conversation whose id doubles as the worker session id.
    pub current_conversation_id: Option<String>,
    pub status: AgentStatus,
    pub context_usage: Option<ContextUsage>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            current_conversation_id: None,
            status: AgentStatus::Stopped,
            context_usage: None,
        }
    }
}

/// Conversation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub label: Option<String>,
    pub message_count: usize,
    pub created_at: u64,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Project>, StoreError>;
    async fn update_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError>;
    async fn update_context_usage(&self, id: &str, usage: &ContextUsage)
    -> Result<(), StoreError>;
    async fn set_current_conversation(
        &self,
        id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation with a freshly generated id.
    async fn create(&self, project_id: &str, label: Option<&str>)
    -> Result<Conversation, StoreError>;
    async fn add_message(
        &self,
        conversation_id: &str,
        message: &DomainMessage,
    ) -> Result<(), StoreError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;
    /// Persist any buffered writes.
    async fn flush(&self) -> Result<(), StoreError>;
}

/// Source of the current settings snapshot.
pub trait SettingsProvider: Send + Sync {
    fn get(&self) -> Config;
}

/// Per-launch overrides of the permission defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionOverrides {
    pub permission_mode: Option<String>,
    pub skip_permissions: Option<bool>,
}

/// Resolves settings plus overrides into effective worker flags.
pub trait PermissionArgsGenerator: Send + Sync {
    fn generate_args(&self, settings: &Config, overrides: &PermissionOverrides) -> PermissionArgs;
}

/// Builds the prompt for an autonomous run.
pub trait InstructionGenerator: Send + Sync {
    fn generate(&self, project: &Project, instructions: &str) -> String;
}
