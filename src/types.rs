//! Core data types shared by the client and the platform handlers.
//!
//! These are the normalized shapes every provider's wire format is
//! translated to and from: per-mode request configuration, tool calls
//! and tool results, and streaming chunk metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AiError, Result};

// --- Finish reasons ---

/// Finish reason reported by OpenAI-style APIs when tools are requested.
pub const FINISH_TOOL_CALLS: &str = "tool_calls";
/// Finish reason reported by Claude when tools are requested.
pub const FINISH_TOOL_USE: &str = "tool_use";

/// Returns true if `reason` means the model is waiting for tool results.
pub fn is_tool_call_finish(reason: &str) -> bool {
    reason == FINISH_TOOL_CALLS || reason == FINISH_TOOL_USE
}

// --- Chat configuration ---

/// Optional parameters for one request mode (plain chat or streaming).
///
/// `None` means "let the provider decide". Explicit temperature and
/// max-tokens always win over same-named keys in `custom_params`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatConfig {
    pub system_role: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Free-form JSON object text, merged into the request body.
    pub custom_params: String,
}

impl ChatConfig {
    /// Set the temperature, clamped to `[0, 2]`.
    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
    }

    /// Set the token limit; zero is raised to 1.
    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = Some(max_tokens.max(1));
    }

    /// Store custom parameters after checking they form a JSON object.
    /// An empty string clears them.
    pub fn set_custom_params(&mut self, json: &str) -> Result<()> {
        if json.trim().is_empty() {
            self.custom_params.clear();
            return Ok(());
        }
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AiError::Validation(format!("Invalid JSON in custom parameters: {}", e)))?;
        if !value.is_object() {
            return Err(AiError::Validation(
                "Custom parameters must be a JSON object".to_string(),
            ));
        }
        self.custom_params = json.to_string();
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Configuration for the tool-calling cycle: the initial request and the
/// follow-up that carries tool results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallConfig {
    pub system_role: String,
    pub max_tokens: Option<u32>,
    pub tool_choice: String,
    pub reply_max_tokens: Option<u32>,
    pub reply_tool_choice: String,
}

impl ToolCallConfig {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// --- Tool choice ---

/// A parsed tool-choice directive. Each handler maps it to its own syntax.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Any,
    /// A provider-specific JSON object, passed through.
    Object(Value),
    /// Anything else; handlers forward or ignore it.
    Other(String),
}

impl ToolChoice {
    /// Parse a caller-supplied directive. Empty input means "unset".
    pub fn parse(raw: &str) -> Option<ToolChoice> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let choice = match trimmed.to_ascii_lowercase().as_str() {
            "auto" => ToolChoice::Auto,
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            "any" => ToolChoice::Any,
            _ if trimmed.starts_with('{') => match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if value.is_object() => ToolChoice::Object(value),
                _ => ToolChoice::Other(trimmed.to_string()),
            },
            _ => ToolChoice::Other(trimmed.to_string()),
        };
        Some(choice)
    }
}

// --- Tool Call ---

/// A tool call requested by the model, in the normalized
/// `{id, type, function: {name, arguments}}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// Function name and JSON-encoded arguments of a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

fn empty_arguments() -> String {
    "{}".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the JSON array returned by `tc_chat` / `tc_reply`.
    pub fn parse_list(json: &str) -> Result<Vec<ToolCall>> {
        serde_json::from_str(json).map_err(|e| AiError::json("Invalid tool calls JSON", e))
    }

    /// Serialize calls into the normalized JSON array text.
    pub fn to_json_list(calls: &[ToolCall]) -> Result<String> {
        serde_json::to_string(calls).map_err(|e| AiError::json("Failed to serialize tool calls", e))
    }

    /// Decoded arguments; malformed argument text yields an empty object.
    pub fn arguments_value(&self) -> Value {
        serde_json::from_str::<Value>(&self.function.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

// --- Tool Result ---

/// The caller's answer to one [`ToolCall`].
///
/// Wire shape accepted by `tc_reply`:
///
/// ```json
/// [{"tool_call_id": "call_1", "function": {"name": "get_weather", "output": "22C"}}]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Validate and decode a tool-results array.
    pub fn parse_list(json: &str) -> Result<Vec<ToolResult>> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AiError::Validation(format!("Invalid JSON in tool results: {}", e)))?;
        let items = value
            .as_array()
            .ok_or_else(|| AiError::Validation("Tool results must be a JSON array.".to_string()))?;

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let tool_call_id = item.get("tool_call_id").filter(|v| !v.is_null()).ok_or_else(|| {
                AiError::Validation("Each tool result must have a 'tool_call_id' field.".to_string())
            })?;
            let function = item.get("function").filter(|v| v.is_object()).ok_or_else(|| {
                AiError::Validation("Each tool result must have a 'function' field.".to_string())
            })?;
            let name = function.get("name").filter(|v| !v.is_null()).ok_or_else(|| {
                AiError::Validation("Each tool result function must have a 'name' field.".to_string())
            })?;
            let output = function.get("output").filter(|v| !v.is_null()).ok_or_else(|| {
                AiError::Validation(
                    "Each tool result function must have an 'output' field.".to_string(),
                )
            })?;

            results.push(ToolResult {
                tool_call_id: value_as_text(tool_call_id),
                name: value_as_text(name),
                output: value_as_text(output),
                is_error: item.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            });
        }
        Ok(results)
    }
}

/// Strings are taken verbatim, anything else is serialized.
pub(crate) fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- Streaming ---

/// Lifecycle of the single stream a client may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Error,
}

/// Metadata delivered to the streaming callback with every chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunkInfo {
    /// Text produced by this chunk only.
    pub content: String,
    pub is_complete: bool,
    /// 1-based index of the raw line this chunk came from.
    pub chunk_index: u32,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
    pub error: String,
}

/// How a successful stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The provider signalled the end of generation.
    Completed,
    /// The callback returned false or a stop was requested.
    Cancelled,
}
