//! Stateful stream-json parser for one agent worker.
//!
//! Implements the tolerant reader pattern: raw output chunks are reassembled
//! into lines, lines that are not JSON objects pass through as plain `stdout`
//! text, unknown event types are logged and dropped. The parser owns all
//! per-worker protocol state: cumulative text for deduplication, tool
//! correlation, per-turn special-tool guards and token usage.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::types::{
    DomainMessage, MessageKind, PermissionInfo, PlanModeAction, PlanModeInfo, Question,
    QuestionInfo, QuestionOption, ResultInfo, StatusChangeInfo, ToolInvocation, ToolStatus,
};
use super::usage::{ContextUsage, UsageUpdate};

const ASK_USER_QUESTION: &str = "AskUserQuestion";
const ENTER_PLAN_MODE: &str = "EnterPlanMode";
const EXIT_PLAN_MODE: &str = "ExitPlanMode";

static SESSION_NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no conversation found with session id:?\s*([A-Za-z0-9_-]+)")
        .expect("static regex is valid")
});

static TOOL_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^(?:error:\s*)?tool\s+['"`]?([\w.:-]+)['"`]?\s+(?:execution\s+)?failed:?\s*(.*)$"#)
        .expect("static regex is valid")
});

/// Everything the parser reports to its owner, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// A message for the hosting application.
    Message(DomainMessage),
    /// `system init`: a new turn began. `session_id` is only set when the
    /// worker reported one.
    SessionInit {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// The merged usage snapshot changed.
    UsageUpdated(ContextUsage),
    WaitingForInput { is_waiting: bool, version: u64 },
    EnterPlanMode,
    ExitPlanMode { plan: String },
    /// The worker could not resume the given session id.
    SessionNotFound(String),
    /// A `result` event closed the current turn.
    TurnComplete { is_error: bool },
    /// An `error` event.
    Error(String),
}

/// Correlation record for a tool call whose result has not arrived yet.
#[derive(Debug, Clone)]
struct ToolCorrelation {
    internal_id: String,
    name: String,
    input: Value,
    completed: bool,
}

/// Tool input being streamed through `input_json_delta` fragments.
#[derive(Debug, Clone)]
struct StreamingTool {
    correlation_id: String,
    name: String,
    partial_json: String,
}

/// Per-turn deduplication state, cleared by [`StreamParser::reset_turn`].
#[derive(Debug, Clone, Default)]
struct TurnState {
    /// Cumulative assistant text of the current message.
    text: String,
    last_question: Option<String>,
    last_plan_mode_action: Option<PlanModeAction>,
    exit_plan_mode_emitted: bool,
}

/// Parser for one worker's stdout.
#[derive(Debug)]
pub struct StreamParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    turn: TurnState,
    /// Worker correlation id -> tool record.
    tools: HashMap<String, ToolCorrelation>,
    /// Content block index -> tool input being streamed.
    streaming_tools: HashMap<u64, StreamingTool>,
    session_id: Option<String>,
    usage: ContextUsage,
    waiting_for_input: bool,
    waiting_version: u64,
    awaiting_compaction_summary: bool,
    next_tool_seq: u64,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(200_000)
    }
}

impl StreamParser {
    /// Create a parser for a worker whose context window is
    /// `max_context_tokens` wide.
    pub fn new(max_context_tokens: u64) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            turn: TurnState::default(),
            tools: HashMap::new(),
            streaming_tools: HashMap::new(),
            session_id: None,
            usage: ContextUsage::new(max_context_tokens),
            waiting_for_input: false,
            waiting_version: 0,
            awaiting_compaction_summary: false,
            next_tool_seq: 0,
        }
    }

    /// Feed a raw output chunk; returns the events of every completed line.
    ///
    /// A trailing partial line stays buffered until the next chunk or
    /// [`finish`](Self::finish).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParserEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let line = String::from_utf8_lossy(&self.buffer[line_start..end]).into_owned();
            self.process_line(&line, &mut out);
            line_start = end + 1;
            search_from = line_start;
        }
        self.buffer.drain(..line_start);
        self.scanned = self.buffer.len();
        out
    }

    /// Flush the buffered partial line, if any. Called once the worker's
    /// stdout has closed.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&rest);
            self.process_line(&line, &mut out);
        }
        out
    }

    /// Parse one complete line.
    pub fn parse_line(&mut self, line: &str) -> Vec<ParserEvent> {
        let mut out = Vec::new();
        self.process_line(line, &mut out);
        out
    }

    /// Clear the per-turn dedup state. Invoked on `system init` and whenever
    /// the user submits input.
    pub fn reset_turn(&mut self) {
        self.turn = TurnState::default();
        self.streaming_tools.clear();
    }

    /// Record a change of the waiting-for-input flag and return the event
    /// announcing it. Every call bumps the version.
    pub fn set_waiting_for_input(&mut self, is_waiting: bool) -> ParserEvent {
        self.waiting_for_input = is_waiting;
        self.waiting_version += 1;
        ParserEvent::WaitingForInput {
            is_waiting,
            version: self.waiting_version,
        }
    }

    /// Session id reported by the last `system init` that carried one.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub const fn context_usage(&self) -> ContextUsage {
        self.usage
    }

    pub const fn is_waiting_for_input(&self) -> bool {
        self.waiting_for_input
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<ParserEvent>) {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return;
        }

        let value = match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                out.push(ParserEvent::Message(DomainMessage::new(
                    MessageKind::Stdout,
                    line,
                )));
                return;
            }
        };

        self.update_usage_from_event(&value, out);

        let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "assistant" => self.handle_assistant(&value, out),
            "user" => self.handle_user(&value, out),
            "system" => self.handle_system(&value, out),
            "result" => self.handle_result(&value, out),
            "error" => self.handle_error(&value, out),
            "control_request" => self.handle_control_request(&value, out),
            "stream_event" => {
                if let Some(inner) = value.get("event") {
                    self.handle_stream_event(inner, out);
                }
            }
            "content_block_start" | "content_block_delta" | "content_block_stop"
            | "message_start" | "message_delta" | "message_stop" => {
                self.handle_stream_event(&value, out);
            }
            other => debug!(event_type = other, "Ignoring unrecognised stream event"),
        }
    }

    /// Merge any `usage` object carried by the event into the snapshot.
    fn update_usage_from_event(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let Some(usage) = usage_object(value) else {
            return;
        };
        let Some(update) = UsageUpdate::from_value(usage) else {
            return;
        };
        if self.usage.merge(&update) {
            out.push(ParserEvent::UsageUpdated(self.usage));
        }
    }

    fn handle_assistant(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let Some(blocks) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            return;
        };

        let text: String = blocks
            .iter()
            .filter(|b| block_type(b) == "text")
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
        self.emit_text_increment(&text, out);

        for block in blocks.iter().filter(|b| block_type(b) == "tool_use") {
            let (Some(id), Some(name)) = (
                block.get("id").and_then(Value::as_str),
                block.get("name").and_then(Value::as_str),
            ) else {
                continue;
            };
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            self.handle_tool_start(id, name, input, out);
        }
    }

    /// Emit only what is new relative to the cumulative text seen so far.
    fn emit_text_increment(&mut self, text: &str, out: &mut Vec<ParserEvent>) {
        if text.is_empty() {
            return;
        }
        let increment = text
            .strip_prefix(self.turn.text.as_str())
            .unwrap_or(text)
            .to_string();
        self.turn.text = text.to_string();
        if !increment.is_empty() {
            out.push(ParserEvent::Message(DomainMessage::new(
                MessageKind::Stdout,
                increment,
            )));
        }
    }

    fn handle_stream_event(&mut self, event: &Value, out: &mut Vec<ParserEvent>) {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);

        match event_type {
            "message_start" => self.turn.text.clear(),
            "content_block_start" => {
                let Some(block) = event.get("content_block") else {
                    return;
                };
                if block_type(block) != "tool_use" {
                    return;
                }
                if let (Some(id), Some(name)) = (
                    block.get("id").and_then(Value::as_str),
                    block.get("name").and_then(Value::as_str),
                ) {
                    self.streaming_tools.insert(
                        index,
                        StreamingTool {
                            correlation_id: id.to_string(),
                            name: name.to_string(),
                            partial_json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.get("delta") else {
                    return;
                };
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        self.turn.text.push_str(text);
                        out.push(ParserEvent::Message(DomainMessage::new(
                            MessageKind::Stdout,
                            text,
                        )));
                    }
                } else if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str)
                    && let Some(tool) = self.streaming_tools.get_mut(&index)
                {
                    tool.partial_json.push_str(fragment);
                }
            }
            "content_block_stop" => {
                let Some(tool) = self.streaming_tools.remove(&index) else {
                    return;
                };
                let raw = if tool.partial_json.trim().is_empty() {
                    "{}"
                } else {
                    tool.partial_json.as_str()
                };
                match serde_json::from_str::<Value>(raw) {
                    Ok(input) => self.handle_tool_start(&tool.correlation_id, &tool.name, input, out),
                    Err(e) => debug!(
                        tool = %tool.name,
                        correlation_id = %tool.correlation_id,
                        error = %e,
                        "Dropping tool call with unparseable streamed input"
                    ),
                }
            }
            _ => {}
        }
    }

    fn handle_tool_start(
        &mut self,
        correlation_id: &str,
        name: &str,
        input: Value,
        out: &mut Vec<ParserEvent>,
    ) {
        match name {
            ASK_USER_QUESTION => self.handle_question(correlation_id, input, out),
            ENTER_PLAN_MODE => self.handle_enter_plan_mode(out),
            EXIT_PLAN_MODE => self.handle_exit_plan_mode(&input, out),
            _ => {
                if self.tools.contains_key(correlation_id) {
                    debug!(correlation_id, tool = name, "Suppressing duplicate tool_use");
                    return;
                }
                let internal_id = self.next_internal_id();
                let description = tool_description(name, &input);
                self.tools.insert(
                    correlation_id.to_string(),
                    ToolCorrelation {
                        internal_id: internal_id.clone(),
                        name: name.to_string(),
                        input: input.clone(),
                        completed: false,
                    },
                );
                let content = if description.is_empty() {
                    name.to_string()
                } else {
                    format!("{name}: {description}")
                };
                out.push(ParserEvent::Message(
                    DomainMessage::new(MessageKind::ToolUse, content).with_tool(ToolInvocation {
                        internal_id,
                        correlation_id: correlation_id.to_string(),
                        name: name.to_string(),
                        input,
                        status: ToolStatus::Running,
                        description,
                        result_content: None,
                    }),
                ));
            }
        }
    }

    fn handle_question(&mut self, correlation_id: &str, input: Value, out: &mut Vec<ParserEvent>) {
        if !self.tools.contains_key(correlation_id) {
            let internal_id = self.next_internal_id();
            self.tools.insert(
                correlation_id.to_string(),
                ToolCorrelation {
                    internal_id,
                    name: ASK_USER_QUESTION.to_string(),
                    input: input.clone(),
                    completed: false,
                },
            );
        }

        let key = input.to_string();
        if self.turn.last_question.as_deref() == Some(key.as_str()) {
            debug!(correlation_id, "Suppressing repeated question");
            return;
        }
        self.turn.last_question = Some(key);

        let questions = parse_questions(&input);
        let content = questions
            .first()
            .map(|q| q.question.clone())
            .unwrap_or_default();
        out.push(ParserEvent::Message(
            DomainMessage::new(MessageKind::Question, content).with_question(QuestionInfo {
                correlation_id: correlation_id.to_string(),
                questions,
            }),
        ));
        out.push(self.set_waiting_for_input(true));
    }

    fn handle_enter_plan_mode(&mut self, out: &mut Vec<ParserEvent>) {
        if self.turn.last_plan_mode_action == Some(PlanModeAction::Enter) {
            debug!("Suppressing repeated EnterPlanMode");
            return;
        }
        self.turn.last_plan_mode_action = Some(PlanModeAction::Enter);
        out.push(ParserEvent::Message(
            DomainMessage::new(MessageKind::PlanMode, "Entering plan mode").with_plan_mode(
                PlanModeInfo {
                    action: PlanModeAction::Enter,
                    plan: None,
                },
            ),
        ));
        out.push(ParserEvent::EnterPlanMode);
    }

    fn handle_exit_plan_mode(&mut self, input: &Value, out: &mut Vec<ParserEvent>) {
        if self.turn.exit_plan_mode_emitted {
            debug!("Suppressing repeated ExitPlanMode");
            return;
        }
        self.turn.exit_plan_mode_emitted = true;
        self.turn.last_plan_mode_action = Some(PlanModeAction::Exit);

        let plan = extract_plan(input);
        out.push(ParserEvent::Message(
            DomainMessage::new(MessageKind::PlanMode, plan.clone()).with_plan_mode(PlanModeInfo {
                action: PlanModeAction::Exit,
                plan: Some(plan.clone()),
            }),
        ));
        out.push(ParserEvent::ExitPlanMode { plan });
    }

    fn handle_user(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let content = value.get("message").and_then(|m| m.get("content"));
        match content {
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match block_type(block) {
                        "tool_result" => self.handle_tool_result(block, out),
                        "text" => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                self.take_compaction_summary(text, out);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some(Value::String(text)) => self.take_compaction_summary(text, out),
            _ => {}
        }
    }

    /// A user text block right after a compact boundary carries the summary.
    fn take_compaction_summary(&mut self, text: &str, out: &mut Vec<ParserEvent>) {
        if !self.awaiting_compaction_summary {
            return;
        }
        self.awaiting_compaction_summary = false;
        out.push(ParserEvent::Message(DomainMessage::new(
            MessageKind::Compaction,
            text,
        )));
    }

    fn handle_tool_result(&mut self, block: &Value, out: &mut Vec<ParserEvent>) {
        let Some(correlation_id) = block.get("tool_use_id").and_then(Value::as_str) else {
            return;
        };
        let Some(tool) = self.tools.get_mut(correlation_id) else {
            debug!(correlation_id, "Dropping tool_result with unknown correlation id");
            return;
        };
        if tool.name == ASK_USER_QUESTION || tool.completed {
            return;
        }
        tool.completed = true;

        let is_error = block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = tool_result_text(block.get("content"));
        let status = if is_error {
            ToolStatus::Failed
        } else {
            ToolStatus::Completed
        };
        out.push(ParserEvent::Message(
            DomainMessage::new(MessageKind::ToolResult, content.clone()).with_tool(ToolInvocation {
                internal_id: tool.internal_id.clone(),
                correlation_id: correlation_id.to_string(),
                name: tool.name.clone(),
                input: tool.input.clone(),
                status,
                description: String::new(),
                result_content: Some(content),
            }),
        ));
    }

    fn handle_system(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
        match subtype {
            "init" => {
                let session_id = value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(String::from);
                if let Some(ref id) = session_id {
                    self.session_id = Some(id.clone());
                }
                self.reset_turn();
                out.push(ParserEvent::SessionInit {
                    session_id,
                    model: value.get("model").and_then(Value::as_str).map(String::from),
                });
            }
            "status" => {
                if value.get("status").and_then(Value::as_str) == Some("compacting") {
                    out.push(ParserEvent::Message(
                        DomainMessage::new(MessageKind::StatusChange, "Compacting conversation")
                            .with_status_change(StatusChangeInfo {
                                status: "compacting".to_string(),
                            }),
                    ));
                }
            }
            "compact_boundary" => {
                self.awaiting_compaction_summary = true;
            }
            "compact" | "summary" => {
                let text = value
                    .get("summary")
                    .or_else(|| value.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or("Conversation compacted");
                out.push(ParserEvent::Message(DomainMessage::new(
                    MessageKind::Compaction,
                    text,
                )));
            }
            other => debug!(subtype = other, "Ignoring system event"),
        }
    }

    fn handle_result(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let subtype = value
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("success")
            .to_string();
        let is_error = value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || subtype != "success";

        let info = ResultInfo {
            subtype: subtype.clone(),
            is_error,
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
            num_turns: value.get("num_turns").and_then(Value::as_u64),
            usage: Some(self.usage),
        };

        let errors: Vec<String> = value
            .get("errors")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(error_text).collect())
            .unwrap_or_default();

        let mut unmatched = Vec::new();
        for error in &errors {
            if let Some(caps) = SESSION_NOT_FOUND_RE.captures(error) {
                out.push(ParserEvent::SessionNotFound(caps[1].to_string()));
            } else if let Some(caps) = TOOL_FAILURE_RE.captures(error) {
                let name = caps[1].to_string();
                let detail = caps[2].trim().to_string();
                let internal_id = self.next_internal_id();
                out.push(ParserEvent::Message(
                    DomainMessage::new(MessageKind::ToolResult, detail.clone()).with_tool(
                        ToolInvocation {
                            internal_id,
                            correlation_id: String::new(),
                            name,
                            input: Value::Null,
                            status: ToolStatus::Failed,
                            description: String::new(),
                            result_content: Some(detail),
                        },
                    ),
                ));
            } else {
                unmatched.push(error.clone());
            }
        }

        if !unmatched.is_empty() {
            out.push(ParserEvent::Message(
                DomainMessage::new(MessageKind::Result, unmatched.join("; ")).with_result(
                    ResultInfo {
                        is_error: true,
                        ..info
                    },
                ),
            ));
        } else if errors.is_empty() {
            let text = value
                .get("result")
                .and_then(Value::as_str)
                .map_or_else(
                    || {
                        if is_error {
                            format!("Agent turn ended with {subtype}")
                        } else {
                            String::new()
                        }
                    },
                    String::from,
                );
            out.push(ParserEvent::Message(
                DomainMessage::new(MessageKind::Result, text).with_result(info),
            ));
            if !is_error {
                out.push(self.set_waiting_for_input(true));
            }
        }

        if let Some(denials) = value.get("permission_denials").and_then(Value::as_array) {
            for denial in denials {
                let tool_name = denial
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                out.push(ParserEvent::Message(
                    DomainMessage::new(
                        MessageKind::Permission,
                        format!("Permission denied for {tool_name}"),
                    )
                    .with_permission(PermissionInfo {
                        request_id: denial
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .map(String::from),
                        tool_name,
                        input: denial.get("tool_input").cloned().unwrap_or(Value::Null),
                        denied: true,
                    }),
                ));
            }
        }

        out.push(ParserEvent::TurnComplete { is_error });
    }

    fn handle_error(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let message = value
            .get("error")
            .and_then(|e| {
                e.get("message")
                    .and_then(Value::as_str)
                    .or_else(|| e.as_str())
            })
            .or_else(|| value.get("message").and_then(Value::as_str))
            .unwrap_or("Unknown error")
            .to_string();
        out.push(ParserEvent::Message(DomainMessage::new(
            MessageKind::Stderr,
            message.clone(),
        )));
        out.push(ParserEvent::Error(message));
    }

    fn handle_control_request(&mut self, value: &Value, out: &mut Vec<ParserEvent>) {
        let Some(request) = value.get("request") else {
            return;
        };
        if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
            debug!("Ignoring control request");
            return;
        }
        let tool_name = request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let input = request.get("input").cloned().unwrap_or(Value::Null);
        let description = tool_description(&tool_name, &input);
        let content = if description.is_empty() {
            format!("Permission requested for {tool_name}")
        } else {
            format!("Permission requested for {tool_name}: {description}")
        };
        out.push(ParserEvent::Message(
            DomainMessage::new(MessageKind::Permission, content).with_permission(PermissionInfo {
                request_id: value
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(String::from),
                tool_name,
                input,
                denied: false,
            }),
        ));
    }

    fn next_internal_id(&mut self) -> String {
        self.next_tool_seq += 1;
        format!("tool-{}", self.next_tool_seq)
    }
}

fn block_type(block: &Value) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or("")
}

/// Locate the `usage` object of an event, wherever the worker put it.
fn usage_object(value: &Value) -> Option<&Value> {
    let inner = value.get("event");
    [
        value.get("usage"),
        value.get("message").and_then(|m| m.get("usage")),
        inner.and_then(|e| e.get("usage")),
        inner
            .and_then(|e| e.get("message"))
            .and_then(|m| m.get("usage")),
    ]
    .into_iter()
    .flatten()
    .find(|u| u.is_object())
}

fn error_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("message").and_then(Value::as_str))
        .map(String::from)
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .map(|b| match block_type(b) {
                "text" => b
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                "image" => "[image]".to_string(),
                _ => b.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn parse_questions(input: &Value) -> Vec<Question> {
    input
        .get("questions")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|q| Question {
                    question: q
                        .get("question")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    header: q.get("header").and_then(Value::as_str).map(String::from),
                    options: q
                        .get("options")
                        .and_then(Value::as_array)
                        .map(|opts| {
                            opts.iter()
                                .map(|o| QuestionOption {
                                    label: o
                                        .get("label")
                                        .and_then(Value::as_str)
                                        .unwrap_or("")
                                        .to_string(),
                                    description: o
                                        .get("description")
                                        .and_then(Value::as_str)
                                        .unwrap_or("")
                                        .to_string(),
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    multi_select: q
                        .get("multiSelect")
                        .or_else(|| q.get("multi_select"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Plan text of an `ExitPlanMode` call: `planContent`, then `plan`, then a
/// list synthesized from `allowedPrompts`.
fn extract_plan(input: &Value) -> String {
    if let Some(plan) = input
        .get("planContent")
        .or_else(|| input.get("plan"))
        .and_then(Value::as_str)
    {
        return plan.to_string();
    }

    let mut plan = String::new();
    if let Some(prompts) = input.get("allowedPrompts").and_then(Value::as_array) {
        for entry in prompts {
            let tool = entry.get("tool").and_then(Value::as_str).unwrap_or("");
            let prompt = entry.get("prompt").and_then(Value::as_str).unwrap_or("");
            if !plan.is_empty() {
                plan.push('\n');
            }
            let _ = write!(plan, "{tool}: {prompt}");
        }
    }
    plan
}

/// Generate a human-readable description from tool name and input.
fn tool_description(name: &str, input: &Value) -> String {
    let Some(obj) = input.as_object() else {
        return String::new();
    };

    match name {
        "Bash" => obj
            .get("command")
            .and_then(Value::as_str)
            .map(|c| truncate_str(c, 120))
            .unwrap_or_default(),
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => obj
            .get("file_path")
            .or_else(|| obj.get("notebook_path"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        "Grep" => {
            let pattern = obj.get("pattern").and_then(Value::as_str).unwrap_or("");
            let path = obj.get("path").and_then(Value::as_str).unwrap_or(".");
            format!("{} in {}", truncate_str(pattern, 60), path)
        }
        "Glob" => obj
            .get("pattern")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        "WebFetch" | "WebSearch" => obj
            .get("url")
            .or_else(|| obj.get("query"))
            .and_then(Value::as_str)
            .map(|s| truncate_str(s, 120))
            .unwrap_or_default(),
        _ => obj
            .values()
            .find_map(Value::as_str)
            .map(|s| truncate_str(s, 80))
            .unwrap_or_default(),
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i <= max)
            .last()
            .map_or(0, |(i, _)| i);
        format!("{}...", &s[..boundary])
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::too_many_lines
)]
mod tests {
    use super::*;

    fn messages(events: &[ParserEvent]) -> Vec<&DomainMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn messages_of(events: &[ParserEvent], kind: MessageKind) -> Vec<&DomainMessage> {
        messages(events)
            .into_iter()
            .filter(|m| m.kind == kind)
            .collect()
    }

    fn assistant_text(text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    fn tool_use(id: &str, name: &str, input: &Value) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": input}]}
        })
        .to_string()
    }

    #[test]
    fn reassembles_lines_across_chunks() {
        let mut parser = StreamParser::default();
        let line = assistant_text("hello");
        let (a, b) = line.split_at(10);

        assert!(parser.push(a.as_bytes()).is_empty());
        let events = parser.push(format!("{b}\n").as_bytes());
        let out = messages_of(&events, MessageKind::Stdout);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "hello");
    }

    #[test]
    fn long_line_in_small_chunks_is_linear() {
        let mut parser = StreamParser::default();
        parser.parse_line(&tool_use("big", "Read", &serde_json::json!({"file_path": "/a"})));
        let payload = "x".repeat(4 * 1024 * 1024);
        let line = serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "big", "content": payload}]}
        })
        .to_string()
            + "\n";

        let started = std::time::Instant::now();
        let mut events = Vec::new();
        for chunk in line.as_bytes().chunks(8 * 1024) {
            events.extend(parser.push(chunk));
        }
        assert!(
            started.elapsed() < std::time::Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
        let results = messages_of(&events, MessageKind::ToolResult);
        assert_eq!(results.len(), 1);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn lines_split_mid_chunk_keep_their_order() {
        let mut parser = StreamParser::default();
        let first = parser.push(b"one\ntw");
        assert_eq!(messages(&first)[0].content, "one");
        let rest = parser.push(b"o\nthree\nfo");
        let contents: Vec<_> = messages(&rest).iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["two", "three"]);
        assert_eq!(messages(&parser.finish())[0].content, "fo");
    }

    #[test]
    fn finish_flushes_partial_line() {
        let mut parser = StreamParser::default();
        assert!(parser.push(b"trailing text without newline").is_empty());
        let events = parser.finish();
        assert_eq!(messages(&events)[0].content, "trailing text without newline");
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn garbled_lines_pass_through_as_stdout() {
        let mut parser = StreamParser::default();
        let events = parser.push(b"not json\n[1,2,3]\n{broken\n\n");
        let out = messages_of(&events, MessageKind::Stdout);
        let texts: Vec<&str> = out.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["not json", "[1,2,3]", "{broken"]);
    }

    #[test]
    fn unknown_event_type_produces_nothing() {
        let mut parser = StreamParser::default();
        assert!(parser.parse_line(r#"{"type":"future_type","x":1}"#).is_empty());
    }

    #[test]
    fn cumulative_text_is_diffed() {
        let mut parser = StreamParser::default();
        let snapshots = ["Hel", "Hello", "Hello, wor", "Hello, world!"];
        let mut emitted = String::new();
        for snapshot in snapshots {
            let events = parser.parse_line(&assistant_text(snapshot));
            for m in messages_of(&events, MessageKind::Stdout) {
                emitted.push_str(&m.content);
            }
        }
        assert_eq!(emitted, "Hello, world!");

        // Re-sending the same cumulative text emits nothing.
        let events = parser.parse_line(&assistant_text("Hello, world!"));
        assert!(messages(&events).is_empty());
    }

    #[test]
    fn non_prefix_text_is_a_fresh_segment() {
        let mut parser = StreamParser::default();
        parser.parse_line(&assistant_text("First answer"));
        let events = parser.parse_line(&assistant_text("Second"));
        assert_eq!(messages(&events)[0].content, "Second");
    }

    #[test]
    fn deltas_then_full_message_do_not_duplicate() {
        let mut parser = StreamParser::default();
        parser.parse_line(r#"{"type":"stream_event","event":{"type":"message_start"}}"#);
        let mut emitted = String::new();
        for piece in ["Hel", "lo"] {
            let line = serde_json::json!({
                "type": "stream_event",
                "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": piece}}
            })
            .to_string();
            for m in messages(&parser.parse_line(&line)) {
                emitted.push_str(&m.content);
            }
        }
        let events = parser.parse_line(&assistant_text("Hello"));
        assert!(messages(&events).is_empty());
        assert_eq!(emitted, "Hello");

        // Next message of the same turn streams from a clean slate.
        parser.parse_line(r#"{"type":"message_start"}"#);
        parser.parse_line(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"World"}}"#,
        );
        let events = parser.parse_line(&assistant_text("World"));
        assert!(messages(&events).is_empty());
    }

    #[test]
    fn tool_use_registers_correlation_and_matches_result() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(&tool_use(
            "toolu_1",
            "Bash",
            &serde_json::json!({"command": "ls -la"}),
        ));
        let uses = messages_of(&events, MessageKind::ToolUse);
        assert_eq!(uses.len(), 1);
        let tool = uses[0].tool_info.as_ref().unwrap();
        assert_eq!(tool.correlation_id, "toolu_1");
        assert_eq!(tool.status, ToolStatus::Running);
        assert_eq!(tool.description, "ls -la");
        let internal_id = tool.internal_id.clone();

        let result = serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "toolu_1", "content": "file.txt"}]}
        })
        .to_string();
        let events = parser.parse_line(&result);
        let results = messages_of(&events, MessageKind::ToolResult);
        assert_eq!(results.len(), 1);
        let tool = results[0].tool_info.as_ref().unwrap();
        assert_eq!(tool.internal_id, internal_id);
        assert_eq!(tool.name, "Bash");
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.result_content.as_deref(), Some("file.txt"));
    }

    #[test]
    fn duplicate_tool_use_ids_are_suppressed() {
        let mut parser = StreamParser::default();
        let line = tool_use("toolu_1", "Read", &serde_json::json!({"file_path": "/a"}));
        assert_eq!(messages(&parser.parse_line(&line)).len(), 1);
        assert!(messages(&parser.parse_line(&line)).is_empty());
    }

    #[test]
    fn failed_tool_result_and_array_content() {
        let mut parser = StreamParser::default();
        parser.parse_line(&tool_use("t1", "Bash", &serde_json::json!({"command": "false"})));
        let result = serde_json::json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result", "tool_use_id": "t1", "is_error": true,
                "content": [{"type": "text", "text": "exit 1"}, {"type": "text", "text": "boom"}]
            }]}
        })
        .to_string();
        let events = parser.parse_line(&result);
        let tool = messages(&events)[0].tool_info.clone().unwrap();
        assert_eq!(tool.status, ToolStatus::Failed);
        assert_eq!(tool.result_content.as_deref(), Some("exit 1\nboom"));
    }

    #[test]
    fn unmatched_tool_result_is_dropped() {
        let mut parser = StreamParser::default();
        let result = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"ghost","content":"x"}]}}"#;
        assert!(parser.parse_line(result).is_empty());
    }

    #[test]
    fn streamed_tool_input_is_emitted_on_block_stop() {
        let mut parser = StreamParser::default();
        parser.parse_line(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t9","name":"Grep"}}"#,
        );
        parser.parse_line(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"pattern\":"}}"#,
        );
        parser.parse_line(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"fn main\"}"}}"#,
        );
        let events = parser.parse_line(r#"{"type":"content_block_stop","index":1}"#);
        let uses = messages_of(&events, MessageKind::ToolUse);
        assert_eq!(uses.len(), 1);
        let tool = uses[0].tool_info.as_ref().unwrap();
        assert_eq!(tool.input["pattern"], "fn main");

        // The complete assistant message repeating the call is suppressed.
        let events = parser.parse_line(&tool_use("t9", "Grep", &serde_json::json!({"pattern": "fn main"})));
        assert!(messages(&events).is_empty());
    }

    #[test]
    fn invalid_streamed_tool_input_is_dropped() {
        let mut parser = StreamParser::default();
        parser.parse_line(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t2","name":"Bash"}}"#,
        );
        parser.parse_line(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}"#,
        );
        let events = parser.parse_line(r#"{"type":"content_block_stop","index":0}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn ask_user_question_emits_question_and_waits() {
        let mut parser = StreamParser::default();
        let input = serde_json::json!({"questions": [{
            "question": "Which database?",
            "header": "DB",
            "multiSelect": true,
            "options": [{"label": "Postgres", "description": "relational"}, {"label": "Redis"}]
        }]});
        let events = parser.parse_line(&tool_use("q1", "AskUserQuestion", &input));
        let questions = messages_of(&events, MessageKind::Question);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].content, "Which database?");
        let info = questions[0].question_info.as_ref().unwrap();
        assert!(info.questions[0].multi_select);
        assert_eq!(info.questions[0].options.len(), 2);
        assert!(events.contains(&ParserEvent::WaitingForInput {
            is_waiting: true,
            version: 1
        }));
        assert!(messages_of(&events, MessageKind::ToolUse).is_empty());

        // Same question under a different wrapper id is suppressed.
        let events = parser.parse_line(&tool_use("q2", "AskUserQuestion", &input));
        assert!(events.is_empty());

        // Its result belongs to the question/answer turn, not tool reporting.
        let result = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"q1","content":"Postgres"}]}}"#;
        assert!(parser.parse_line(result).is_empty());
    }

    #[test]
    fn enter_plan_mode_is_deduplicated_until_reset() {
        let mut parser = StreamParser::default();
        let empty = serde_json::json!({});

        let first = parser.parse_line(&tool_use("p1", "EnterPlanMode", &empty));
        let second = parser.parse_line(&tool_use("p2", "EnterPlanMode", &empty));
        let plan_messages = messages_of(&first, MessageKind::PlanMode).len()
            + messages_of(&second, MessageKind::PlanMode).len();
        assert_eq!(plan_messages, 1);
        assert!(first.contains(&ParserEvent::EnterPlanMode));
        assert!(!second.contains(&ParserEvent::EnterPlanMode));

        parser.parse_line(r#"{"type":"system","subtype":"init","session_id":"s"}"#);
        let third = parser.parse_line(&tool_use("p3", "EnterPlanMode", &empty));
        assert_eq!(messages_of(&third, MessageKind::PlanMode).len(), 1);
        let info = messages(&third)[0].plan_mode_info.clone().unwrap();
        assert_eq!(info.action, PlanModeAction::Enter);
    }

    #[test]
    fn exit_plan_mode_extracts_plan() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(&tool_use(
            "x1",
            "ExitPlanMode",
            &serde_json::json!({"planContent": "1. Write tests\n2. Ship"}),
        ));
        assert!(events.contains(&ParserEvent::ExitPlanMode {
            plan: "1. Write tests\n2. Ship".to_string()
        }));
        // Emitted once per turn.
        let again = parser.parse_line(&tool_use("x2", "ExitPlanMode", &serde_json::json!({})));
        assert!(again.is_empty());

        parser.reset_turn();
        let events = parser.parse_line(&tool_use(
            "x3",
            "ExitPlanMode",
            &serde_json::json!({"allowedPrompts": [
                {"tool": "Bash", "prompt": "run tests"},
                {"tool": "Edit", "prompt": "update docs"}
            ]}),
        ));
        assert!(events.contains(&ParserEvent::ExitPlanMode {
            plan: "Bash: run tests\nEdit: update docs".to_string()
        }));
    }

    #[test]
    fn system_init_captures_session_id_only_when_present() {
        let mut parser = StreamParser::default();
        parser.parse_line(r#"{"type":"system","subtype":"init","session_id":"abc","model":"m"}"#);
        assert_eq!(parser.session_id(), Some("abc"));

        let events = parser.parse_line(r#"{"type":"system","subtype":"init"}"#);
        assert_eq!(parser.session_id(), Some("abc"));
        assert_eq!(
            events,
            vec![ParserEvent::SessionInit {
                session_id: None,
                model: None
            }]
        );
    }

    #[test]
    fn compacting_status_and_boundary_summary() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(r#"{"type":"system","subtype":"status","status":"compacting"}"#);
        let status = messages_of(&events, MessageKind::StatusChange);
        assert_eq!(
            status[0].status_change_info.as_ref().unwrap().status,
            "compacting"
        );

        assert!(parser
            .parse_line(r#"{"type":"system","subtype":"compact_boundary"}"#)
            .is_empty());
        let events = parser.parse_line(
            r#"{"type":"user","message":{"content":[{"type":"text","text":"Summary of earlier work"}]}}"#,
        );
        let compaction = messages_of(&events, MessageKind::Compaction);
        assert_eq!(compaction[0].content, "Summary of earlier work");

        // Latch is consumed: ordinary user text is not a summary.
        let events = parser.parse_line(
            r#"{"type":"user","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn result_session_not_found_is_not_a_generic_error() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(
            r#"{"type":"result","subtype":"error_during_execution","is_error":true,"errors":["No conversation found with session ID: abc-123"]}"#,
        );
        assert!(events.contains(&ParserEvent::SessionNotFound("abc-123".to_string())));
        assert!(messages_of(&events, MessageKind::Result).is_empty());
        assert_eq!(
            events.last(),
            Some(&ParserEvent::TurnComplete { is_error: true })
        );
    }

    #[test]
    fn result_tool_failure_and_unmatched_errors() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(
            r#"{"type":"result","subtype":"error_during_execution","is_error":true,"errors":["Tool Bash failed: permission denied","disk on fire"]}"#,
        );
        let tool = messages_of(&events, MessageKind::ToolResult);
        assert_eq!(tool.len(), 1);
        let info = tool[0].tool_info.as_ref().unwrap();
        assert_eq!(info.name, "Bash");
        assert_eq!(info.status, ToolStatus::Failed);
        assert_eq!(tool[0].content, "permission denied");

        let results = messages_of(&events, MessageKind::Result);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "disk on fire");
        assert!(results[0].result_info.as_ref().unwrap().is_error);
    }

    #[test]
    fn success_result_sets_waiting_for_input() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(
            r#"{"type":"result","subtype":"success","result":"Done","duration_ms":1200,"total_cost_usd":0.01,"num_turns":2}"#,
        );
        let result = messages_of(&events, MessageKind::Result);
        assert_eq!(result[0].content, "Done");
        let info = result[0].result_info.as_ref().unwrap();
        assert!(!info.is_error);
        assert_eq!(info.duration_ms, Some(1200));
        assert!(events.contains(&ParserEvent::WaitingForInput {
            is_waiting: true,
            version: 1
        }));
        assert!(parser.is_waiting_for_input());
        assert_eq!(
            events.last(),
            Some(&ParserEvent::TurnComplete { is_error: false })
        );
    }

    #[test]
    fn result_permission_denials_emit_permission_messages() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(
            r#"{"type":"result","subtype":"success","permission_denials":[{"tool_name":"Write","tool_use_id":"t5","tool_input":{"file_path":"/etc/passwd"}}]}"#,
        );
        let perms = messages_of(&events, MessageKind::Permission);
        assert_eq!(perms.len(), 1);
        let info = perms[0].permission_info.as_ref().unwrap();
        assert!(info.denied);
        assert_eq!(info.tool_name, "Write");
    }

    #[test]
    fn error_event_defaults_message() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(r#"{"type":"error"}"#);
        assert_eq!(messages(&events)[0].kind, MessageKind::Stderr);
        assert!(events.contains(&ParserEvent::Error("Unknown error".to_string())));

        let events = parser.parse_line(r#"{"type":"error","error":{"message":"rate limited"}}"#);
        assert!(events.contains(&ParserEvent::Error("rate limited".to_string())));
    }

    #[test]
    fn control_request_emits_permission() {
        let mut parser = StreamParser::default();
        let events = parser.parse_line(
            r#"{"type":"control_request","request_id":"req_1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf build"}}}"#,
        );
        let perms = messages_of(&events, MessageKind::Permission);
        assert_eq!(perms[0].content, "Permission requested for Bash: rm -rf build");
        assert_eq!(
            perms[0].permission_info.as_ref().unwrap().request_id.as_deref(),
            Some("req_1")
        );
    }

    #[test]
    fn usage_is_merged_from_nested_locations() {
        let mut parser = StreamParser::new(1000);
        let events = parser.parse_line(
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":100,"output_tokens":20}}}"#,
        );
        let ParserEvent::UsageUpdated(usage) = &events[0] else {
            panic!("expected usage update, got {events:?}");
        };
        assert_eq!(usage.total_tokens, 120);
        assert!((usage.percent_used - 12.0).abs() < f64::EPSILON);

        // Smaller per-call numbers never shrink the snapshot.
        let events = parser.parse_line(
            r#"{"type":"stream_event","event":{"type":"message_delta","usage":{"output_tokens":5}}}"#,
        );
        assert!(events.is_empty());
        assert_eq!(parser.context_usage().output_tokens, 20);
    }

    #[test]
    fn truncate_str_handles_multibyte_utf8() {
        let s = "héllo wörld ".repeat(20);
        let out = truncate_str(&s, 10);
        assert!(out.ends_with("..."));
    }
}
