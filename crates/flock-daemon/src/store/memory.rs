//! In-memory stores.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use flock_core::ndjson::{ContextUsage, DomainMessage, now_millis};

use super::{Conversation, ConversationStore, Project, ProjectStore, StoreError};
use crate::subprocess::AgentStatus;

#[derive(Debug, Clone, Default)]
pub struct MemoryProjectStore {
    projects: Arc<RwLock<HashMap<String, Project>>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, project: Project) {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(id)
            .ok_or_else(|| StoreError::ProjectNotFound(id.to_string()))?;
        project.status = status;
        Ok(())
    }

    async fn update_context_usage(
        &self,
        id: &str,
        usage: &ContextUsage,
    ) -> Result<(), StoreError> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(id)
            .ok_or_else(|| StoreError::ProjectNotFound(id.to_string()))?;
        project.context_usage = Some(*usage);
        Ok(())
    }

    async fn set_current_conversation(
        &self,
        id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(id)
            .ok_or_else(|| StoreError::ProjectNotFound(id.to_string()))?;
        project.current_conversation_id = Some(conversation_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredConversation {
    meta: Conversation,
    messages: Vec<DomainMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, StoredConversation>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of a conversation, oldest first.
    pub async fn messages(&self, id: &str) -> Vec<DomainMessage> {
        self.conversations
            .read()
            .await
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create(
        &self,
        project_id: &str,
        label: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let meta = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            label: label.map(String::from),
            message_count: 0,
            created_at: now_millis(),
        };
        self.conversations.write().await.insert(
            meta.id.clone(),
            StoredConversation {
                meta: meta.clone(),
                messages: Vec::new(),
            },
        );
        Ok(meta)
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        message: &DomainMessage,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        conversation.messages.push(message.clone());
        conversation.meta.message_count = conversation.messages.len();
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(id).map(|c| c.meta.clone()))
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.conversations.write().await.remove(id);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flock_core::ndjson::MessageKind;

    #[tokio::test]
    async fn project_updates_require_existing_project() {
        let store = MemoryProjectStore::new();
        let err = store
            .update_status("missing", AgentStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ProjectNotFound(_)));

        store.insert(Project::new("p1", "Demo", "/tmp/demo")).await;
        store.update_status("p1", AgentStatus::Running).await.unwrap();
        store.set_current_conversation("p1", "c1").await.unwrap();
        let project = store.find_by_id("p1").await.unwrap().unwrap();
        assert_eq!(project.status, AgentStatus::Running);
        assert_eq!(project.current_conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn conversation_message_count_tracks_appends() {
        let store = MemoryConversationStore::new();
        let conv = store.create("p1", Some("run")).await.unwrap();
        assert_eq!(conv.message_count, 0);
        assert!(uuid::Uuid::parse_str(&conv.id).is_ok());

        store
            .add_message(&conv.id, &DomainMessage::new(MessageKind::Stdout, "hi"))
            .await
            .unwrap();
        let found = store.find_by_id(&conv.id).await.unwrap().unwrap();
        assert_eq!(found.message_count, 1);
        assert_eq!(store.messages(&conv.id).await[0].content, "hi");

        store.delete_conversation(&conv.id).await.unwrap();
        assert!(store.find_by_id(&conv.id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
