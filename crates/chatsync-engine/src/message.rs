//! Message identity, in-flight snapshots and finalized records

use chatsync_wire::{ChunkKind, ToolCall, ToolCallUpdate, ToolResult};
use serde::{Deserialize, Serialize};

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Logical kind of an assistant message; one handler exists per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Text,
    Reasoning,
    ToolCall,
    ToolsAggregate,
}

impl MessageKind {
    /// Handler kind responsible for a wire chunk kind.
    ///
    /// `usage` and `error` are not messages and map to `None`.
    pub fn for_chunk(kind: ChunkKind) -> Option<Self> {
        match kind {
            ChunkKind::Text => Some(Self::Text),
            ChunkKind::Reasoning => Some(Self::Reasoning),
            ChunkKind::ToolCall => Some(Self::ToolCall),
            ChunkKind::ToolCallUpdate | ChunkKind::ToolResult => Some(Self::ToolsAggregate),
            ChunkKind::Usage | ChunkKind::Error => None,
        }
    }
}

/// UI-facing identity of a message.
///
/// The backend reuses one raw id for several logical messages (text,
/// reasoning, tool calls of one step), so the display id appends a suffix
/// chosen by kind. Tool updates and tool results share a suffix and converge
/// on one aggregate message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(String);

impl DisplayId {
    /// Use an id as-is (user messages, history records)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Suffix used for a chunk kind
    pub fn suffix_for(kind: ChunkKind) -> &'static str {
        match kind {
            ChunkKind::Text => "text",
            ChunkKind::Reasoning => "reasoning",
            ChunkKind::ToolCall => "tool-call",
            ChunkKind::ToolCallUpdate | ChunkKind::ToolResult => "tools",
            ChunkKind::Usage => "usage",
            ChunkKind::Error => "error",
        }
    }

    /// Derive the display id for a raw message id and chunk kind
    pub fn derive(raw_message_id: &str, kind: ChunkKind) -> Self {
        Self(format!("{}:{}", raw_message_id, Self::suffix_for(kind)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DisplayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phase of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initial,
    Streaming,
    Complete,
}

/// A tool call whose arguments are still arriving as JSON fragments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDraft {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    /// Concatenated argument fragments, in arrival order
    pub arguments_json: String,
}

impl ToolCallDraft {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            id: None,
            name: String::new(),
            arguments_json: String::new(),
        }
    }

    /// Rebuild a draft from a finished call
    pub fn from_call(index: usize, call: &ToolCall) -> Self {
        Self {
            index,
            id: Some(call.id.clone()),
            name: call.name.clone(),
            arguments_json: call.arguments.to_string(),
        }
    }

    /// Merge a streamed fragment
    pub fn apply(&mut self, update: &ToolCallUpdate) {
        if let Some(id) = update.id.as_ref().filter(|id| !id.is_empty()) {
            self.id = Some(id.clone());
        }
        if let Some(name) = update.name.as_ref().filter(|name| !name.is_empty()) {
            self.name = name.clone();
        }
        if let Some(fragment) = &update.arguments_delta {
            self.arguments_json.push_str(fragment);
        }
    }

    /// Best-effort view of the arguments while they are still incomplete
    pub fn partial_arguments(&self) -> serde_json::Value {
        parse_partial_json(&self.arguments_json).unwrap_or(serde_json::Value::Null)
    }

    /// Finish the call. On unparseable arguments the raw text is kept as a
    /// JSON string and the parse error is returned alongside.
    pub fn finish(&self) -> (ToolCall, Option<String>) {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{}", self.index));
        let (arguments, error) = if self.arguments_json.trim().is_empty() {
            (serde_json::Value::Object(Default::default()), None)
        } else {
            match serde_json::from_str(&self.arguments_json) {
                Ok(value) => (value, None),
                Err(e) => (
                    serde_json::Value::String(self.arguments_json.clone()),
                    Some(format!("invalid arguments for tool call {}: {}", id, e)),
                ),
            }
        };
        (
            ToolCall {
                id,
                name: self.name.clone(),
                arguments,
            },
            error,
        )
    }
}

/// Find the draft a fragment belongs to: by index first, then by id.
pub(crate) fn locate_draft<'a, T: 'a>(
    entries: impl IntoIterator<Item = &'a T>,
    draft_of: impl Fn(&T) -> &ToolCallDraft,
    update: &ToolCallUpdate,
) -> Option<usize> {
    let drafts: Vec<&ToolCallDraft> = entries.into_iter().map(|e| draft_of(e)).collect();
    update
        .index
        .and_then(|index| drafts.iter().position(|d| d.index == index))
        .or_else(|| {
            update.id.as_deref().and_then(|id| {
                drafts
                    .iter()
                    .position(|d| d.id.as_deref() == Some(id))
            })
        })
}

/// A streamed tool call and, once known, its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPairDraft {
    pub call: ToolCallDraft,
    pub result: Option<ToolResult>,
}

/// A finished tool call and its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPair {
    pub call: ToolCall,
    pub result: Option<ToolResult>,
}

/// Kind-specific accumulator of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SnapshotContent {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        visible: bool,
    },
    ToolCall {
        calls: Vec<ToolCallDraft>,
    },
    ToolsAggregate {
        pairs: Vec<ToolPairDraft>,
        /// Results that arrived before their call
        pending_results: Vec<ToolResult>,
    },
}

impl SnapshotContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Reasoning { .. } => MessageKind::Reasoning,
            Self::ToolCall { .. } => MessageKind::ToolCall,
            Self::ToolsAggregate { .. } => MessageKind::ToolsAggregate,
        }
    }
}

/// Mutable view of a message that is still receiving chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    pub display_id: DisplayId,
    pub conversation_id: String,
    pub role: Role,
    pub created_at: i64,
    /// Provisional until the completion supplies the authoritative number
    pub sequence_number: u64,
    pub streaming: bool,
    pub phase: Phase,
    #[serde(flatten)]
    pub content: SnapshotContent,
}

impl MessageSnapshot {
    pub fn message_kind(&self) -> MessageKind {
        self.content.kind()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }
}

/// Finalized content of a record. The `messageKind` tag is part of the
/// content, so rewriting other record fields never loses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RecordContent {
    Text { text: String },
    Reasoning { text: String, visible: bool },
    ToolCall { tool_calls: Vec<ToolCall> },
    ToolsAggregate { pairs: Vec<ToolPair> },
}

impl RecordContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Reasoning { .. } => MessageKind::Reasoning,
            Self::ToolCall { .. } => MessageKind::ToolCall,
            Self::ToolsAggregate { .. } => MessageKind::ToolsAggregate,
        }
    }
}

/// A message placed in the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: DisplayId,
    pub conversation_id: String,
    pub role: Role,
    pub timestamp: i64,
    /// Authoritative ordering key
    pub sequence_number: u64,
    #[serde(flatten)]
    pub content: RecordContent,
}

impl MessageRecord {
    /// Create the record for a user's message
    pub fn user(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: i64,
        sequence_number: u64,
    ) -> Self {
        Self {
            id: DisplayId::new(id),
            conversation_id: conversation_id.into(),
            role: Role::User,
            timestamp,
            sequence_number,
            content: RecordContent::Text { text: text.into() },
        }
    }

    pub fn message_kind(&self) -> MessageKind {
        self.content.kind()
    }

    /// Text of a text or reasoning record
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            RecordContent::Text { text } | RecordContent::Reasoning { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Parse JSON that may have been cut off mid-stream.
///
/// Complete documents parse as-is. Otherwise open strings, arrays and objects
/// are closed (a dangling `,` is dropped, a dangling `:` gets `null`) and the
/// result is parsed again. Returns `None` when even the repaired text is not
/// valid JSON.
pub fn parse_partial_json(text: &str) -> Option<serde_json::Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut repaired = text.to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    } else {
        let trimmed = repaired.trim_end().len();
        repaired.truncate(trimmed);
        if repaired.ends_with(',') {
            repaired.pop();
        } else if repaired.ends_with(':') {
            repaired.push_str("null");
        }
    }
    while let Some(closer) = closers.pop() {
        repaired.push(closer);
    }

    serde_json::from_str(&repaired).ok()
}
