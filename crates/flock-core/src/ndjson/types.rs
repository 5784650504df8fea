//! Domain message model produced by the stream parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use super::usage::ContextUsage;

/// Kind of a [`DomainMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Stdout,
    Stderr,
    System,
    ToolUse,
    ToolResult,
    User,
    Question,
    Permission,
    PlanMode,
    Compaction,
    Result,
    StatusChange,
}

/// The parser's output unit, delivered to the hosting application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_info: Option<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_info: Option<QuestionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_info: Option<PermissionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_mode_info: Option<PlanModeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_info: Option<ResultInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_change_info: Option<StatusChangeInfo>,
}

impl DomainMessage {
    /// Create a message of the given kind stamped with the current time.
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: now_millis(),
            tool_info: None,
            question_info: None,
            permission_info: None,
            plan_mode_info: None,
            result_info: None,
            status_change_info: None,
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: ToolInvocation) -> Self {
        self.tool_info = Some(tool);
        self
    }

    #[must_use]
    pub fn with_question(mut self, question: QuestionInfo) -> Self {
        self.question_info = Some(question);
        self
    }

    #[must_use]
    pub fn with_permission(mut self, permission: PermissionInfo) -> Self {
        self.permission_info = Some(permission);
        self
    }

    #[must_use]
    pub fn with_plan_mode(mut self, plan_mode: PlanModeInfo) -> Self {
        self.plan_mode_info = Some(plan_mode);
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: ResultInfo) -> Self {
        self.result_info = Some(result);
        self
    }

    #[must_use]
    pub fn with_status_change(mut self, status: StatusChangeInfo) -> Self {
        self.status_change_info = Some(status);
        self
    }
}

/// Lifecycle of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

/// A tool call made by the worker.
///
/// `correlation_id` is assigned by the worker and only used to match the
/// later `tool_result`; `internal_id` is stable within this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub internal_id: String,
    pub correlation_id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_content: Option<String>,
}

/// Payload of a `question` message (an `AskUserQuestion` tool call).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionInfo {
    pub correlation_id: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub options: Vec<QuestionOption>,
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Payload of a `permission` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub tool_name: String,
    pub input: Value,
    /// `true` when reported as an already-denied call in a `result` event.
    pub denied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanModeAction {
    Enter,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanModeInfo {
    pub action: PlanModeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

/// Payload of a `result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    pub subtype: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ContextUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeInfo {
    pub status: String,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
}
