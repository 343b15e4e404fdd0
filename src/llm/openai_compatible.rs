//! OpenAI-compatible platform handler.
//!
//! Also serves DeepSeek, which speaks the same chat-completions dialect
//! with a different endpoint and token-limit field (see [`Dialect`]).

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::common::{self, ExchangeState};
use super::{ChatRequest, Platform, PlatformHandler};
use crate::error::{AiError, Result};
use crate::transport::Transport;
#[cfg(feature = "tool-calls")]
use super::{FollowUpRequest, ToolCallsReply, ToolCallsRequest};
#[cfg(feature = "stream-chat")]
use super::StreamChunk;
#[cfg(feature = "tool-calls")]
use crate::types::{ToolCall, ToolChoice};

pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// The parts of the chat-completions format that vary between vendors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dialect {
    pub platform: Platform,
    pub default_endpoint: &'static str,
    pub max_tokens_field: &'static str,
}

impl Dialect {
    pub const OPENAI: Dialect = Dialect {
        platform: Platform::OpenAi,
        default_endpoint: OPENAI_ENDPOINT,
        max_tokens_field: "max_completion_tokens",
    };
}

// --- Response types ---

#[derive(Deserialize, Debug)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct ApiChoice {
    message: Option<ApiResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiResponseMessage {
    content: Option<String>,
    #[cfg(feature = "tool-calls")]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiUsage {
    total_tokens: Option<u64>,
}

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug)]
struct StreamResponseChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAiCompatibleHandler {
    dialect: Dialect,
    state: ExchangeState,
}

impl OpenAiCompatibleHandler {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::OPENAI)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: ExchangeState::default(),
        }
    }

    fn messages(system_role: &str, user_message: &str) -> Vec<Value> {
        let mut messages = Vec::with_capacity(2);
        if !system_role.is_empty() {
            messages.push(json!({"role": "system", "content": system_role}));
        }
        messages.push(json!({"role": "user", "content": user_message}));
        messages
    }

    fn chat_body(&self, request: &ChatRequest<'_>, stream: bool) -> Result<Value> {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert(
            "messages".to_string(),
            Value::Array(Self::messages(request.system_role, request.user_message)),
        );
        if stream {
            body.insert("stream".to_string(), json!(true));
        }

        let skip: &[&str] = if stream {
            &["model", "messages", "stream"]
        } else {
            &["model", "messages"]
        };
        common::merge_custom_params(&mut body, request.custom_params, skip)?;

        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert(self.dialect.max_tokens_field.to_string(), json!(max_tokens));
        }
        Ok(Value::Object(body))
    }

    /// Reset state, decode, and reject error envelopes. Records usage and
    /// the first choice's finish reason.
    fn begin_parse(&mut self, body: &str) -> Result<ApiResponse> {
        self.state.reset();
        let doc = common::parse_json(body)?;
        if let Some(message) = common::api_error_message(&doc) {
            return Err(AiError::Api(message));
        }
        let response: ApiResponse = common::decode(doc)?;
        self.state.total_tokens = response.usage.as_ref().and_then(|u| u.total_tokens);
        self.state.finish_reason = response.choices.first().and_then(|c| c.finish_reason.clone());
        Ok(response)
    }
}

impl Default for OpenAiCompatibleHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tool-calls")]
fn tools_value(tools: &[String]) -> Result<Value> {
    let specs = common::parse_tools(tools)?;
    Ok(Value::Array(
        specs
            .into_iter()
            .map(|spec| {
                let mut function = Map::new();
                function.insert("name".to_string(), json!(spec.name));
                if let Some(description) = spec.description {
                    function.insert("description".to_string(), json!(description));
                }
                function.insert("parameters".to_string(), spec.parameters);
                json!({"type": "function", "function": function})
            })
            .collect(),
    ))
}

#[cfg(feature = "tool-calls")]
fn tool_choice_value(raw: &str) -> Option<Value> {
    let choice = match ToolChoice::parse(raw)? {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required | ToolChoice::Any => json!("required"),
        ToolChoice::Object(value) => value,
        ToolChoice::Other(text) => {
            warn!(tool_choice = %text, "unrecognized tool_choice, forwarding as-is");
            json!(text)
        }
    };
    Some(choice)
}

impl PlatformHandler for OpenAiCompatibleHandler {
    fn platform(&self) -> Platform {
        self.dialect.platform
    }

    fn endpoint(&self, _model: &str, _api_key: &str, custom_endpoint: &str) -> String {
        if custom_endpoint.is_empty() {
            self.dialect.default_endpoint.to_string()
        } else {
            custom_endpoint.to_string()
        }
    }

    fn set_headers(&self, transport: &mut dyn Transport, api_key: &str) {
        transport.set_header("Content-Type", "application/json");
        transport.set_header("Authorization", &format!("Bearer {}", api_key));
    }

    fn build_request_body(&self, request: &ChatRequest<'_>) -> Result<String> {
        common::to_body(&self.chat_body(request, false)?)
    }

    fn parse_response_body(&mut self, body: &str) -> Result<String> {
        let response = self.begin_parse(body)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| {
                AiError::Parse("Could not find 'choices[0].message.content' in response.".to_string())
            })
    }

    fn exchange(&self) -> &ExchangeState {
        &self.state
    }

    fn exchange_mut(&mut self) -> &mut ExchangeState {
        &mut self.state
    }

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_request_body(&self, request: &ToolCallsRequest<'_>) -> Result<String> {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert(
            "messages".to_string(),
            Value::Array(Self::messages(request.system_role, request.user_message)),
        );
        body.insert("tools".to_string(), tools_value(request.tools)?);
        if let Some(choice) = tool_choice_value(request.tool_choice) {
            body.insert("tool_choice".to_string(), choice);
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert(self.dialect.max_tokens_field.to_string(), json!(max_tokens));
        }
        common::to_body(&Value::Object(body))
    }

    #[cfg(feature = "tool-calls")]
    fn parse_tool_calls_response_body(&mut self, body: &str) -> Result<ToolCallsReply> {
        let response = self.begin_parse(body)?;
        let message = response.choices.into_iter().next().and_then(|c| c.message);

        if let Some(mut calls) = message.as_ref().and_then(|m| m.tool_calls.clone()) {
            for call in calls.iter_mut().filter(|call| call.id.is_empty()) {
                call.id = common::generate_call_id();
            }
            return Ok(ToolCallsReply::Calls(calls));
        }

        message
            .and_then(|m| m.content)
            .map(ToolCallsReply::Text)
            .ok_or_else(|| {
                AiError::Parse(
                    "Could not find 'choices[0].message.content' or 'choices[0].message.tool_calls' in response."
                        .to_string(),
                )
            })
    }

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_follow_up_request_body(
        &self,
        request: &FollowUpRequest<'_>,
    ) -> Result<String> {
        let mut messages = Self::messages(request.system_role, request.user_message);
        let calls = serde_json::to_value(request.tool_calls)
            .map_err(|e| AiError::json("Failed to serialize tool calls", e))?;
        messages.push(json!({"role": "assistant", "tool_calls": calls}));
        for result in request.tool_results {
            messages.push(json!({
                "role": "tool",
                "tool_call_id": result.tool_call_id,
                "content": result.output,
            }));
        }

        let mut body = Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert("tools".to_string(), tools_value(request.tools)?);
        if let Some(choice) = tool_choice_value(request.tool_choice) {
            body.insert("tool_choice".to_string(), choice);
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert(self.dialect.max_tokens_field.to_string(), json!(max_tokens));
        }
        common::to_body(&Value::Object(body))
    }

    #[cfg(feature = "stream-chat")]
    fn build_stream_request_body(&self, request: &ChatRequest<'_>) -> Result<String> {
        common::to_body(&self.chat_body(request, true)?)
    }

    #[cfg(feature = "stream-chat")]
    fn process_stream_chunk(&mut self, line: &str) -> Result<StreamChunk> {
        let Some(data) = common::sse_data(line) else {
            return Ok(StreamChunk::empty());
        };
        if data == "[DONE]" {
            return Ok(StreamChunk::complete());
        }
        if data.is_empty() {
            return Ok(StreamChunk::empty());
        }

        let doc: Value = serde_json::from_str(data)
            .map_err(|e| AiError::json("Failed to parse streaming chunk JSON", e))?;
        if let Some(message) = common::api_error_message(&doc) {
            return Err(AiError::Api(message));
        }
        let parsed: StreamResponseChunk = common::decode(doc)?;
        if let Some(total) = parsed.usage.and_then(|u| u.total_tokens) {
            self.state.total_tokens = Some(total);
        }

        // The finish chunk may be followed by a usage chunk; only [DONE] ends the stream.
        let mut chunk = StreamChunk::empty();
        if let Some(choice) = parsed.choices.into_iter().next() {
            if let Some(reason) = choice.finish_reason {
                self.state.finish_reason = Some(reason);
            }
            if let Some(text) = choice.delta.and_then(|d| d.content) {
                chunk.content = text;
            }
        }
        Ok(chunk)
    }
}
