//! Wire payload types shared by the decoder, the engine and the retrieval client

use serde::{Deserialize, Serialize};

/// Logical message kind carried in the `kind` field of message events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    Text,
    Reasoning,
    ToolCall,
    ToolCallUpdate,
    ToolResult,
    Usage,
    Error,
}

impl ChunkKind {
    /// Parse the wire spelling of a kind
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "reasoning" => Some(Self::Reasoning),
            "tool-call" => Some(Self::ToolCall),
            "tool-call-update" => Some(Self::ToolCallUpdate),
            "tool-result" => Some(Self::ToolResult),
            "usage" => Some(Self::Usage),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
            Self::ToolCall => "tool-call",
            Self::ToolCallUpdate => "tool-call-update",
            Self::ToolResult => "tool-result",
            Self::Usage => "usage",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A fragment of a tool call while it streams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Position of the call within the message
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Next fragment of the argument JSON text
    #[serde(default, alias = "arguments", alias = "argsTextDelta")]
    pub arguments_delta: Option<String>,
}

/// Output of a tool, paired with its call by `tool_call_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
}

/// Token usage reported at the end of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cached_input_tokens: u64,
}

impl Usage {
    /// Sum of input and output tokens
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage report into this one
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
    }
}

/// Task-tracker operation announced by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOperationType {
    Start,
    Complete,
    Sync,
}

impl TaskOperationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "complete" => Some(Self::Complete),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

/// One node of a task tree. Fields beyond the ones the client reads are kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskNode>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Task state as sent on the wire: either a bare list or an object wrapping
/// a `tasks` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskState {
    List(Vec<TaskNode>),
    Wrapped {
        tasks: Vec<TaskNode>,
        #[serde(default)]
        version: Option<u64>,
    },
}

impl TaskState {
    /// Parse a raw task-state value
    pub fn from_value(value: &serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value.clone())
    }

    /// Version embedded in the wrapped form, if any
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::List(_) => None,
            Self::Wrapped { version, .. } => *version,
        }
    }

    pub fn into_tasks(self) -> Vec<TaskNode> {
        match self {
            Self::List(tasks) | Self::Wrapped { tasks, .. } => tasks,
        }
    }
}

/// A message as returned by the history retrieval endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "kebab-case")]
pub enum HistoryMessage {
    User {
        id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: u64,
    },
    Text {
        id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: u64,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        reasoning: String,
        #[serde(default = "default_visible")]
        visible: bool,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: u64,
    },
    ToolCall {
        id: String,
        #[serde(rename = "toolCalls", default)]
        tool_calls: Vec<ToolCall>,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: u64,
    },
    Tools {
        id: String,
        #[serde(rename = "toolCalls", default)]
        tool_calls: Vec<ToolCall>,
        #[serde(rename = "toolResults", default)]
        tool_results: Vec<ToolResult>,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: u64,
    },
}

fn default_visible() -> bool {
    true
}
