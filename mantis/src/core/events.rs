//! Agent stream protocol: line framing, event decoding and progress notices.
//!
//! The agent CLI writes one JSON object per line. Decoding is tolerant: a line
//! that is not JSON is surfaced verbatim as a progress notice and the stream
//! keeps going; a JSON object of an unrecognized shape becomes
//! [`AgentEvent::Unknown`] with the raw value attached.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const TEXT_PREVIEW_CHARS: usize = 240;
const COMMAND_PREVIEW_CHARS: usize = 80;

/// Splits a byte stream into complete lines; a trailing partial line is held back.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
            );
        }
        lines
    }

    /// Remaining bytes after EOF, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// The terminal `result` object of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub subtype: String,
    pub success: bool,
    pub result_text: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub errors: Vec<String>,
}

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Init {
        session_id: Option<String>,
        model: Option<String>,
        tool_count: usize,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
        content: String,
        /// `<kind> <file>` from the structured tool result, e.g. `create a.py`.
        summary: Option<String>,
    },
    FinalResult(FinalResult),
    Unknown {
        kind: String,
        raw: Value,
    },
}

/// Outcome of decoding one line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Blank,
    /// One line may carry several content blocks, hence several events.
    Events(Vec<AgentEvent>),
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    System(WireSystem),
    Assistant(WireMessageEvent),
    User(WireMessageEvent),
    Result(WireResult),
}

#[derive(Debug, Deserialize)]
struct WireSystem {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMessageEvent {
    message: WireMessage,
    #[serde(default)]
    tool_use_result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: WireContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Blocks(Vec<WireBlock>),
    Text(String),
}

impl Default for WireContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Decode one line of agent output.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Blank;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return ParsedLine::Malformed(line.to_string()),
    };
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value::<WireEvent>(value.clone()) {
        Ok(WireEvent::System(system)) if system.subtype.as_deref().is_some_and(|s| s != "init") => {
            ParsedLine::Events(vec![AgentEvent::Unknown { kind, raw: value }])
        }
        Ok(wire) => ParsedLine::Events(lower(wire)),
        Err(err) => {
            debug!(kind = %kind, err = %err, "unrecognized agent event");
            ParsedLine::Events(vec![AgentEvent::Unknown { kind, raw: value }])
        }
    }
}

fn lower(wire: WireEvent) -> Vec<AgentEvent> {
    match wire {
        WireEvent::System(system) => vec![AgentEvent::Init {
            session_id: system.session_id,
            model: system.model,
            tool_count: system.tools.len(),
        }],
        WireEvent::Assistant(event) => match event.message.content {
            WireContent::Text(text) => text_event(text).into_iter().collect(),
            WireContent::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|block| match block {
                    WireBlock::Text { text } => text_event(text),
                    WireBlock::ToolUse { id, name, input } => {
                        Some(AgentEvent::ToolCall { id, name, input })
                    }
                    WireBlock::ToolResult { .. } | WireBlock::Other => None,
                })
                .collect(),
        },
        WireEvent::User(event) => {
            let summary = event.tool_use_result.as_ref().and_then(file_change_summary);
            let WireContent::Blocks(blocks) = event.message.content else {
                return Vec::new();
            };
            blocks
                .into_iter()
                .filter_map(|block| match block {
                    WireBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some(AgentEvent::ToolResult {
                        tool_use_id,
                        is_error,
                        content: content_text(&content),
                        summary: summary.clone(),
                    }),
                    _ => None,
                })
                .collect()
        }
        WireEvent::Result(result) => vec![AgentEvent::FinalResult(FinalResult {
            success: !result.is_error && (result.subtype.is_empty() || result.subtype == "success"),
            subtype: result.subtype,
            result_text: result.result.unwrap_or_default(),
            session_id: result.session_id,
            cost_usd: result.total_cost_usd.or(result.cost_usd),
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
            errors: result.errors,
        })],
    }
}

fn text_event(text: String) -> Option<AgentEvent> {
    (!text.trim().is_empty()).then_some(AgentEvent::AssistantText { text })
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn file_change_summary(info: &Value) -> Option<String> {
    let kind = info.get("type").and_then(Value::as_str)?;
    let path = info
        .get("filePath")
        .or_else(|| info.get("file_path"))
        .and_then(Value::as_str)?;
    Some(format!("{kind} {path}"))
}

/// One-line description of a tool invocation.
pub fn tool_summary(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str);
    let detail = match name {
        "Write" | "Read" | "Edit" | "MultiEdit" => field("file_path").map(str::to_string),
        "NotebookEdit" => field("notebook_path").map(str::to_string),
        "Bash" => field("command").map(|cmd| preview(cmd.lines().next().unwrap_or(cmd), COMMAND_PREVIEW_CHARS)),
        "Glob" | "Grep" => field("pattern").map(str::to_string),
        "WebFetch" => field("url").map(str::to_string),
        "WebSearch" => field("query").map(str::to_string),
        "Task" => field("description").map(str::to_string),
        "TodoWrite" => input
            .get("todos")
            .and_then(Value::as_array)
            .map(|todos| format!("{} items", todos.len())),
        _ => None,
    };
    match detail {
        Some(detail) => format!("{name} {detail}"),
        None => name.to_string(),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
    #[serde(default, rename = "activeForm", skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

/// Structured progress emitted when the agent updates its todo list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoSnapshot {
    pub items: Vec<TodoItem>,
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
}

impl TodoSnapshot {
    pub fn from_items(items: Vec<TodoItem>) -> Self {
        let count = |status| items.iter().filter(|i| i.status == status).count();
        Self {
            completed: count(TodoStatus::Completed),
            in_progress: count(TodoStatus::InProgress),
            pending: count(TodoStatus::Pending),
            items,
        }
    }

    /// The item currently being worked on, if any.
    pub fn current(&self) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.status == TodoStatus::InProgress)
    }
}

/// Receiver for human-readable progress and todo snapshots.
pub trait ProgressSink {
    fn progress(&self, message: &str);

    fn todos(&self, _snapshot: &TodoSnapshot) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&self, _message: &str) {}
}

/// Something the adapter should forward to its sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Progress(String),
    Todos(TodoSnapshot),
}

impl Notice {
    pub fn deliver(&self, sink: &dyn ProgressSink) {
        match self {
            Self::Progress(message) => sink.progress(message),
            Self::Todos(snapshot) => sink.todos(snapshot),
        }
    }
}

/// Per-call state machine turning raw lines into notices.
///
/// Keeps only the pending todo lists (keyed by tool-use id) and the single
/// final result; every other event is dropped once its notice is produced.
#[derive(Debug, Default)]
pub struct EventInterpreter {
    pending_todos: HashMap<String, Vec<TodoItem>>,
    final_result: Option<FinalResult>,
    session_id: Option<String>,
    malformed_lines: usize,
}

impl EventInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume_line(&mut self, line: &str) -> Vec<Notice> {
        match parse_line(line) {
            ParsedLine::Blank => Vec::new(),
            ParsedLine::Malformed(raw) => {
                self.malformed_lines += 1;
                vec![Notice::Progress(raw)]
            }
            ParsedLine::Events(events) => events
                .into_iter()
                .flat_map(|event| self.consume_event(event))
                .collect(),
        }
    }

    pub fn consume_event(&mut self, event: AgentEvent) -> Vec<Notice> {
        match event {
            AgentEvent::Init {
                session_id,
                model,
                tool_count,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                vec![Notice::Progress(format!(
                    "agent ready (model: {}, {tool_count} tools)",
                    model.as_deref().unwrap_or("default")
                ))]
            }
            AgentEvent::AssistantText { text } => {
                vec![Notice::Progress(preview(&text, TEXT_PREVIEW_CHARS))]
            }
            AgentEvent::ToolCall { id, name, input } => {
                if name == "TodoWrite"
                    && let Some(todos) = input.get("todos")
                    && let Ok(items) = serde_json::from_value::<Vec<TodoItem>>(todos.clone())
                {
                    self.pending_todos.insert(id, items);
                }
                vec![Notice::Progress(format!("-> {}", tool_summary(&name, &input)))]
            }
            AgentEvent::ToolResult {
                tool_use_id,
                is_error,
                content,
                summary,
            } => {
                let todos = self.pending_todos.remove(&tool_use_id);
                let mut notices = Vec::with_capacity(2);
                if is_error {
                    let first = content.lines().next().unwrap_or_default();
                    notices.push(Notice::Progress(format!(
                        "tool failed: {}",
                        preview(first, TEXT_PREVIEW_CHARS)
                    )));
                } else {
                    notices.push(Notice::Progress(match summary {
                        Some(summary) => format!("tool ok: {summary}"),
                        None => "tool ok".to_string(),
                    }));
                    if let Some(items) = todos {
                        notices.push(Notice::Todos(TodoSnapshot::from_items(items)));
                    }
                }
                notices
            }
            AgentEvent::FinalResult(result) => {
                let cost = result
                    .cost_usd
                    .map(|c| format!(", cost ${c:.4}"))
                    .unwrap_or_default();
                let notice = Notice::Progress(format!(
                    "finished: {}{cost}",
                    if result.success { "success" } else { "error" }
                ));
                if result.session_id.is_some() {
                    self.session_id.clone_from(&result.session_id);
                }
                self.final_result = Some(result);
                vec![notice]
            }
            AgentEvent::Unknown { kind, .. } => {
                debug!(kind = %kind, "skipping agent event");
                Vec::new()
            }
        }
    }

    pub fn final_result(&self) -> Option<&FinalResult> {
        self.final_result.as_ref()
    }

    pub fn take_final_result(&mut self) -> Option<FinalResult> {
        self.final_result.take()
    }

    /// Latest session id seen on an init or result event.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn malformed_lines(&self) -> usize {
        self.malformed_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"s-1","model":"sonnet","tools":["Read","Write","Edit"]}"#;
    const WRITE: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Write","input":{"file_path":"a.py","content":"x = 1"}}]}}"#;
    const WRITE_RESULT: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"File created"}]},"tool_use_result":{"type":"create","filePath":"a.py"}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"s-1","total_cost_usd":0.01,"duration_ms":1200}"#;

    fn progress(notices: &[Notice]) -> Vec<String> {
        notices
            .iter()
            .filter_map(|n| match n {
                Notice::Progress(m) => Some(m.clone()),
                Notice::Todos(_) => None,
            })
            .collect()
    }

    /// Verifies the canonical four-event session yields four progress notices.
    #[test]
    fn four_events_four_notices() {
        let mut interp = EventInterpreter::new();
        let notices: Vec<Notice> = [INIT, WRITE, WRITE_RESULT, RESULT]
            .iter()
            .flat_map(|line| interp.consume_line(line))
            .collect();
        assert_eq!(
            progress(&notices),
            vec![
                "agent ready (model: sonnet, 3 tools)",
                "-> Write a.py",
                "tool ok: create a.py",
                "finished: success, cost $0.0100",
            ]
        );
        let result = interp.final_result().expect("final result");
        assert!(result.success);
        assert_eq!(result.cost_usd, Some(0.01));
        assert_eq!(interp.session_id(), Some("s-1"));
    }

    /// Verifies a malformed line is surfaced and does not stop decoding.
    #[test]
    fn malformed_line_is_passed_through() {
        let mut interp = EventInterpreter::new();
        let mut notices = interp.consume_line(INIT);
        notices.extend(interp.consume_line("Warning: something {not json"));
        notices.extend(interp.consume_line(RESULT));
        assert_eq!(
            progress(&notices),
            vec![
                "agent ready (model: sonnet, 3 tools)",
                "Warning: something {not json",
                "finished: success, cost $0.0100",
            ]
        );
        assert_eq!(interp.malformed_lines(), 1);
        assert!(interp.final_result().is_some());
    }

    /// Verifies unknown shapes decode to the unknown variant with the raw value.
    #[test]
    fn unknown_event_keeps_raw_value() {
        let ParsedLine::Events(events) = parse_line(r#"{"type":"stream_event","event":{}}"#) else {
            panic!("expected events");
        };
        let AgentEvent::Unknown { kind, raw } = &events[0] else {
            panic!("expected unknown, got {events:?}");
        };
        assert_eq!(kind, "stream_event");
        assert_eq!(raw["event"], json!({}));
        assert_eq!(parse_line("  "), ParsedLine::Blank);
        assert!(matches!(parse_line("[1, 2"), ParsedLine::Malformed(_)));
    }

    /// Verifies todo snapshots are emitted once the TodoWrite call succeeds.
    #[test]
    fn todo_write_emits_snapshot() {
        let call = json!({"type": "assistant", "message": {"content": [{
            "type": "tool_use", "id": "todo-1", "name": "TodoWrite",
            "input": {"todos": [
                {"content": "plan", "status": "completed", "activeForm": "Planning"},
                {"content": "write tests", "status": "in_progress", "activeForm": "Writing tests"},
                {"content": "review", "status": "pending"}
            ]}
        }]}});
        let result = json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "todo-1", "content": "ok"}
        ]}});

        let mut interp = EventInterpreter::new();
        let first = interp.consume_line(&call.to_string());
        assert_eq!(progress(&first), vec!["-> TodoWrite 3 items"]);
        let second = interp.consume_line(&result.to_string());
        let snapshot = second
            .iter()
            .find_map(|n| match n {
                Notice::Todos(s) => Some(s.clone()),
                Notice::Progress(_) => None,
            })
            .expect("snapshot");
        assert_eq!(
            (snapshot.completed, snapshot.in_progress, snapshot.pending),
            (1, 1, 1)
        );
        assert_eq!(
            snapshot.current().map(|i| i.content.as_str()),
            Some("write tests")
        );
    }

    /// Verifies error results and error tool results.
    #[test]
    fn error_results() {
        let mut interp = EventInterpreter::new();
        let notices = interp.consume_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"x","content":[{"type":"text","text":"permission denied\nmore"}],"is_error":true}]}}"#,
        );
        assert_eq!(progress(&notices), vec!["tool failed: permission denied"]);

        interp.consume_line(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true,"errors":["too many turns"]}"#,
        );
        let result = interp.final_result().expect("result");
        assert!(!result.success);
        assert_eq!(result.errors, vec!["too many turns"]);
    }

    /// Verifies line framing across chunk boundaries.
    #[test]
    fn line_buffer_reassembles_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\r\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buf.push(b":2}\n\n"), vec!["{\"b\":2}", ""]);
        assert_eq!(buf.push(b"tail"), Vec::<String>::new());
        assert_eq!(buf.finish().as_deref(), Some("tail"));
        assert_eq!(buf.finish(), None);
    }

    /// Verifies per-tool summaries.
    #[test]
    fn tool_summaries() {
        assert_eq!(
            tool_summary("Bash", &json!({"command": "pytest -q\necho done"})),
            "Bash pytest -q"
        );
        assert_eq!(tool_summary("Grep", &json!({"pattern": "TC-\\d+"})), "Grep TC-\\d+");
        assert_eq!(tool_summary("Mystery", &json!({})), "Mystery");
    }
}
