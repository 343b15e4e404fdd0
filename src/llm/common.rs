//! Translation helpers shared by every handler.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{AiError, Result};

/// Finish reason and token total of the most recent parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeState {
    pub finish_reason: Option<String>,
    pub total_tokens: Option<u64>,
}

impl ExchangeState {
    pub fn reset(&mut self) {
        self.finish_reason = None;
        self.total_tokens = None;
    }
}

/// Deserialize a response body, reporting failures as parse errors.
pub(crate) fn parse_json(body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| AiError::json("JSON Deserialization failed", e))
}

/// Read a decoded document into a typed wire struct.
pub(crate) fn decode<T: DeserializeOwned>(doc: Value) -> Result<T> {
    serde_json::from_value(doc).map_err(|e| AiError::json("Unexpected response structure", e))
}

pub(crate) fn to_body(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AiError::json("Failed to serialize request", e))
}

/// Message of a top-level `{"error": {...}}` envelope, if present.
pub(crate) fn api_error_message(doc: &Value) -> Option<String> {
    let error = doc.get("error").filter(|e| !e.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("Unknown error");
    Some(message.to_string())
}

/// Copy custom parameters into `body`, skipping keys the handler computes
/// itself. Keys already present are overwritten; callers apply explicit
/// settings afterwards so those win.
pub(crate) fn merge_custom_params(
    body: &mut Map<String, Value>,
    custom_params: &str,
    skip: &[&str],
) -> Result<()> {
    for (key, value) in custom_param_entries(custom_params)? {
        if !skip.contains(&key.as_str()) {
            body.insert(key, value);
        }
    }
    Ok(())
}

/// Decode custom parameters into key/value pairs. Empty text yields none.
pub(crate) fn custom_param_entries(custom_params: &str) -> Result<Map<String, Value>> {
    if custom_params.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(custom_params) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AiError::Validation(
            "Custom parameters must be a JSON object".to_string(),
        )),
        Err(e) => Err(AiError::Validation(format!(
            "Invalid JSON in custom parameters: {}",
            e
        ))),
    }
}

/// Identifier for a tool call the provider did not name.
pub(crate) fn generate_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Payload of an SSE `data:` line, or `None` for any other framing.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).trim())
}

// --- Tool definitions ---

/// A tool definition normalized from either accepted shape:
/// flat `{name, description, parameters}` or
/// wrapped `{type: "function", function: {...}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

impl ToolSpec {
    /// Parse tool number `position` (1-based, used in messages).
    pub fn parse(raw: &str, position: usize) -> Result<ToolSpec> {
        let doc: Value = serde_json::from_str(raw).map_err(|e| {
            AiError::Validation(format!("Invalid JSON in tool #{}: {}", position, e))
        })?;

        let source = if doc.get("name").is_some() {
            &doc
        } else if doc.get("type").is_some() && doc.get("function").is_some() {
            &doc["function"]
        } else {
            return Err(missing_field("name", position));
        };

        let name = source
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("name", position))?;
        let parameters = source
            .get("parameters")
            .filter(|p| !p.is_null())
            .ok_or_else(|| missing_field("parameters", position))?;

        Ok(ToolSpec {
            name: name.to_string(),
            description: source
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            parameters: parameters.clone(),
        })
    }
}

fn missing_field(field: &str, position: usize) -> AiError {
    AiError::Validation(format!("Missing '{}' field in tool #{}", field, position))
}

/// Validate a tool set against the byte budget and parse every entry.
pub fn validate_tools(tools: &[String], budget: usize) -> Result<Vec<ToolSpec>> {
    let total: usize = tools.iter().map(String::len).sum();
    if total > budget {
        return Err(AiError::Validation(format!(
            "Tool calls definition too large. Total size: {} bytes, maximum allowed: {} bytes.",
            total, budget
        )));
    }
    tools
        .iter()
        .enumerate()
        .map(|(i, raw)| ToolSpec::parse(raw, i + 1))
        .collect()
}

/// Parse registered tools at request-build time.
pub(crate) fn parse_tools(tools: &[String]) -> Result<Vec<ToolSpec>> {
    validate_tools(tools, usize::MAX)
}
