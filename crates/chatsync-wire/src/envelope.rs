//! Typed envelopes and the decoder/validator that produces them
//!
//! Every wire record is decoded into an [`EventEnvelope`]. Decoding is
//! forgiving about representation (numbers may arrive as strings, tool-call
//! arguments may arrive JSON-encoded) but strict about required fields. A
//! record that fails validation is logged and dropped; it never ends the
//! stream.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::frame::Frame;
use crate::types::{
    ChunkKind, TaskOperationType, ToolCall, ToolCallUpdate, ToolResult, Usage,
};

/// Payload keys whose presence marks a completed message
pub const TERMINAL_KEYS: [&str; 4] = ["text", "reasoning", "toolCalls", "usage"];

/// Payload keys that mark an incremental chunk
pub const CHUNK_KEYS: [&str; 3] = ["delta", "toolCallUpdate", "toolResult"];

/// A decoded wire event
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Conversation the event belongs to (wire `chatId`)
    pub conversation_id: String,
    /// Protocol version, when the backend sends one
    pub version: Option<u32>,
    /// Server clock in milliseconds since the epoch
    pub server_timestamp: Option<i64>,
    pub body: EnvelopeBody,
}

/// Kind-specific part of an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    TurnStart(TurnStart),
    StreamChunk(StreamChunk),
    MessageComplete(MessageComplete),
    StreamComplete,
    TaskOperation(TaskOperation),
    Error(ErrorEvent),
}

/// Discriminant of [`EnvelopeBody`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    TurnStart,
    StreamChunk,
    MessageComplete,
    StreamComplete,
    TaskOperation,
    Error,
}

impl EventEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match &self.body {
            EnvelopeBody::TurnStart(_) => EnvelopeKind::TurnStart,
            EnvelopeBody::StreamChunk(_) => EnvelopeKind::StreamChunk,
            EnvelopeBody::MessageComplete(_) => EnvelopeKind::MessageComplete,
            EnvelopeBody::StreamComplete => EnvelopeKind::StreamComplete,
            EnvelopeBody::TaskOperation(_) => EnvelopeKind::TaskOperation,
            EnvelopeBody::Error(_) => EnvelopeKind::Error,
        }
    }
}

/// Start of a turn: the user's message has been accepted
#[derive(Debug, Clone, PartialEq)]
pub struct TurnStart {
    pub user_message_id: String,
    pub user_timestamp: i64,
    pub user_sequence_number: u64,
    pub user_content: Option<String>,
}

/// Incremental update for one logical message
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub raw_message_id: String,
    pub sequence_id: u64,
    pub chunk_kind: ChunkKind,
    pub payload: ChunkPayload,
}

/// Fields a chunk may carry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPayload {
    pub delta: Option<String>,
    pub tool_call_update: Option<ToolCallUpdate>,
    pub tool_result: Option<ToolResult>,
    /// Reasoning visibility toggle
    pub visible: Option<bool>,
}

/// Authoritative final content for one logical message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageComplete {
    pub raw_message_id: String,
    pub sequence_id: u64,
    pub chunk_kind: ChunkKind,
    pub final_payload: FinalPayload,
}

/// Fields a completion may carry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalPayload {
    pub text: Option<String>,
    pub reasoning: Option<String>,
    pub visible: Option<bool>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Vec<ToolResult>,
    pub usage: Option<Usage>,
}

/// Task-tracker operation
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOperation {
    pub operation: TaskOperationType,
    /// Raw task state; its shape is validated by the consumer
    pub task_state: Option<Value>,
    pub state_version: Option<u64>,
}

/// Error reported by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub message: String,
    pub code: Option<String>,
    pub raw_message_id: Option<String>,
}

/// Whether a message payload is an increment or a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Chunk,
    Complete,
}

/// Classify a message payload by its key set.
///
/// Any terminal key wins over any chunk key, regardless of key order or of
/// which wire event name carried the payload. A payload with neither is
/// unrecognized.
pub fn classify_payload(payload: &Map<String, Value>) -> Option<PayloadShape> {
    if TERMINAL_KEYS.iter().any(|k| payload.contains_key(*k)) {
        Some(PayloadShape::Complete)
    } else if CHUNK_KEYS.iter().any(|k| payload.contains_key(*k)) {
        Some(PayloadShape::Chunk)
    } else {
        None
    }
}

/// Decode a record, logging and discarding it when invalid
pub fn decode(event_name: &str, payload_json: &str) -> Option<EventEnvelope> {
    match try_decode(event_name, payload_json) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(event = event_name, error = %e, "Dropping invalid record");
            None
        }
    }
}

/// Decode a parsed frame
pub fn decode_frame(frame: &Frame) -> Option<EventEnvelope> {
    decode(&frame.event, &frame.data)
}

/// Decode a record, reporting why it was rejected
pub fn try_decode(event_name: &str, payload_json: &str) -> Result<EventEnvelope, DecodeError> {
    let value: Value = serde_json::from_str(payload_json)
        .map_err(|e| DecodeError::MalformedJson(e.to_string()))?;
    let obj = value.as_object().ok_or(DecodeError::InvalidField {
        field: "<root>",
        reason: "expected a JSON object".to_string(),
    })?;

    let conversation_id = required_string(obj, "chatId")?;
    let version = obj
        .get("version")
        .and_then(coerce_u64)
        .and_then(|v| u32::try_from(v).ok());
    let server_timestamp = obj.get("timestamp").and_then(coerce_timestamp);

    let body = match event_name {
        "init" => EnvelopeBody::TurnStart(decode_turn_start(obj)?),
        "complete" => EnvelopeBody::StreamComplete,
        "task_operation" => EnvelopeBody::TaskOperation(decode_task_operation(obj)?),
        "error" => EnvelopeBody::Error(decode_error(obj, None)),
        "message" | "messageupdate" => decode_message(obj)?,
        other => return Err(DecodeError::UnknownEvent(other.to_string())),
    };

    Ok(EventEnvelope {
        conversation_id,
        version,
        server_timestamp,
        body,
    })
}

fn decode_turn_start(obj: &Map<String, Value>) -> Result<TurnStart, DecodeError> {
    let payload = required_object(obj, "payload")?;
    let user_timestamp = payload
        .get("userTimestamp")
        .filter(|v| !v.is_null())
        .ok_or(DecodeError::MissingField("payload.userTimestamp"))
        .and_then(|v| {
            coerce_timestamp(v).ok_or_else(|| DecodeError::InvalidField {
                field: "payload.userTimestamp",
                reason: format!("not a timestamp: {}", v),
            })
        })?;

    Ok(TurnStart {
        user_message_id: required_string(payload, "userMessageId")
            .map_err(|e| nest(e, "payload.userMessageId"))?,
        user_timestamp,
        user_sequence_number: required_u64(payload, "userSequenceNumber")
            .map_err(|e| nest(e, "payload.userSequenceNumber"))?,
        user_content: payload
            .get("userContent")
            .or_else(|| payload.get("userMessage"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_task_operation(obj: &Map<String, Value>) -> Result<TaskOperation, DecodeError> {
    let payload = required_object(obj, "payload")?;
    let op = required_string(payload, "operationType")
        .map_err(|e| nest(e, "payload.operationType"))?;
    let operation = TaskOperationType::parse(&op).ok_or_else(|| DecodeError::InvalidField {
        field: "payload.operationType",
        reason: format!("unknown operation `{}`", op),
    })?;

    Ok(TaskOperation {
        operation,
        task_state: payload.get("taskState").filter(|v| !v.is_null()).cloned(),
        state_version: payload.get("version").and_then(coerce_u64),
    })
}

fn decode_error(obj: &Map<String, Value>, raw_message_id: Option<String>) -> ErrorEvent {
    let payload = obj.get("payload").and_then(Value::as_object);

    let message = error_field(payload, obj, "message")
        .or_else(|| error_field(payload, obj, "error"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string();
    let code = error_field(payload, obj, "code").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    ErrorEvent {
        message,
        code,
        raw_message_id,
    }
}

/// Error details live in `payload` but some backends put them at the top level.
fn error_field<'a>(
    payload: Option<&'a Map<String, Value>>,
    obj: &'a Map<String, Value>,
    key: &str,
) -> Option<&'a Value> {
    payload.and_then(|p| p.get(key)).or_else(|| obj.get(key))
}

fn decode_message(obj: &Map<String, Value>) -> Result<EnvelopeBody, DecodeError> {
    let kind = required_string(obj, "kind")?;
    if kind == "error" {
        let raw_message_id = optional_string(obj, "messageId");
        return Ok(EnvelopeBody::Error(decode_error(obj, raw_message_id)));
    }

    let chunk_kind = ChunkKind::parse(&kind).ok_or(DecodeError::UnknownKind(kind))?;
    let raw_message_id = required_string(obj, "messageId")?;
    let sequence_id = required_u64(obj, "sequenceId")?;
    let payload = required_object(obj, "payload")?;

    match classify_payload(payload) {
        Some(PayloadShape::Complete) => Ok(EnvelopeBody::MessageComplete(MessageComplete {
            raw_message_id,
            sequence_id,
            chunk_kind,
            final_payload: decode_final_payload(payload)?,
        })),
        Some(PayloadShape::Chunk) => Ok(EnvelopeBody::StreamChunk(StreamChunk {
            raw_message_id,
            sequence_id,
            chunk_kind,
            payload: decode_chunk_payload(payload)?,
        })),
        None => Err(DecodeError::UnrecognizedShape),
    }
}

fn decode_chunk_payload(payload: &Map<String, Value>) -> Result<ChunkPayload, DecodeError> {
    let tool_call_update = match payload.get("toolCallUpdate").filter(|v| !v.is_null()) {
        Some(v) => Some(serde_json::from_value::<ToolCallUpdate>(v.clone()).map_err(|e| {
            DecodeError::InvalidField {
                field: "payload.toolCallUpdate",
                reason: e.to_string(),
            }
        })?),
        None => None,
    };
    let tool_result = match payload.get("toolResult").filter(|v| !v.is_null()) {
        Some(v) => Some(decode_tool_result(v, "payload.toolResult")?),
        None => None,
    };

    Ok(ChunkPayload {
        delta: payload.get("delta").and_then(Value::as_str).map(str::to_string),
        tool_call_update,
        tool_result,
        visible: payload.get("visible").and_then(Value::as_bool),
    })
}

fn decode_final_payload(payload: &Map<String, Value>) -> Result<FinalPayload, DecodeError> {
    let tool_calls = match payload.get("toolCalls").filter(|v| !v.is_null()) {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(decode_tool_call)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "payload.toolCalls",
                reason: format!("expected an array, got {}", other),
            });
        }
        None => None,
    };

    let tool_results = match payload.get("toolResults").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .map(|v| decode_tool_result(v, "payload.toolResults"))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let usage = match payload.get("usage").filter(|v| !v.is_null()) {
        Some(v) => Some(serde_json::from_value::<Usage>(v.clone()).map_err(|e| {
            DecodeError::InvalidField {
                field: "payload.usage",
                reason: e.to_string(),
            }
        })?),
        None => None,
    };

    Ok(FinalPayload {
        text: payload.get("text").and_then(Value::as_str).map(str::to_string),
        reasoning: payload
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::to_string),
        visible: payload.get("visible").and_then(Value::as_bool),
        tool_calls,
        tool_results,
        usage,
    })
}

fn decode_tool_call(value: &Value) -> Result<ToolCall, DecodeError> {
    let obj = value.as_object().ok_or(DecodeError::InvalidField {
        field: "payload.toolCalls",
        reason: "tool call is not an object".to_string(),
    })?;
    let id = required_string(obj, "id").map_err(|e| nest(e, "payload.toolCalls[].id"))?;
    let name = optional_string(obj, "name").unwrap_or_default();
    let arguments = match obj.get("arguments") {
        // Arguments are often sent JSON-encoded
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
        Some(v) => v.clone(),
        None => Value::Null,
    };
    Ok(ToolCall {
        id,
        name,
        arguments,
    })
}

fn decode_tool_result(value: &Value, field: &'static str) -> Result<ToolResult, DecodeError> {
    serde_json::from_value::<ToolResult>(value.clone()).map_err(|e| DecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn nest(error: DecodeError, path: &'static str) -> DecodeError {
    match error {
        DecodeError::MissingField(_) => DecodeError::MissingField(path),
        DecodeError::InvalidField { reason, .. } => DecodeError::InvalidField {
            field: path,
            reason,
        },
        other => other,
    }
}

fn required_object<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a Map<String, Value>, DecodeError> {
    match obj.get(key) {
        Some(Value::Object(inner)) => Ok(inner),
        None | Some(Value::Null) => Err(DecodeError::MissingField(key)),
        Some(other) => Err(DecodeError::InvalidField {
            field: key,
            reason: format!("expected an object, got {}", other),
        }),
    }
}

/// Ids may arrive as strings or numbers; both become strings.
fn required_string(obj: &Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        None | Some(Value::Null) => Err(DecodeError::MissingField(key)),
        Some(Value::String(_)) => Err(DecodeError::InvalidField {
            field: key,
            reason: "empty string".to_string(),
        }),
        Some(other) => Err(DecodeError::InvalidField {
            field: key,
            reason: format!("expected a string, got {}", other),
        }),
    }
}

fn optional_string(obj: &Map<String, Value>, key: &'static str) -> Option<String> {
    required_string(obj, key).ok()
}

fn required_u64(obj: &Map<String, Value>, key: &'static str) -> Result<u64, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(key)),
        Some(v) => coerce_u64(v).ok_or_else(|| DecodeError::InvalidField {
            field: key,
            reason: format!("not a non-negative integer: {}", v),
        }),
    }
}

/// Accept `7`, `7.0` and `"7"`.
pub fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accept epoch milliseconds as a number or string, or an RFC 3339 date.
pub fn coerce_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}
