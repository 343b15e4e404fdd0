//! Claude (Anthropic Messages API) platform handler.

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

pub const CLAUDE_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Claude rejects requests without `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

// --- Response types ---

#[derive(Deserialize, Debug)]
struct ApiResponse {
    content: Option<Vec<ContentBlock>>,
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[cfg_attr(not(feature = "tool-calls"), allow(dead_code))]
    ToolUse {
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
struct ApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl ApiUsage {
    fn total(&self) -> u64 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

// --- Streaming event types ---

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        usage: Option<ApiUsage>,
    },
    MessageStop,
    Error,
    /// ping, content_block_start, content_block_stop and future events
    #[serde(other)]
    Other,
}

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug, Default)]
struct StreamMessage {
    usage: Option<ApiUsage>,
}

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(feature = "stream-chat")]
#[derive(Deserialize, Debug, Default)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

pub struct ClaudeHandler {
    state: ExchangeState,
    /// Input tokens reported by `message_start`; `message_delta` only
    /// carries the cumulative output count.
    stream_input_tokens: u64,
}

impl ClaudeHandler {
    pub fn new() -> Self {
        Self {
            state: ExchangeState::default(),
            stream_input_tokens: 0,
        }
    }

    fn chat_body(request: &ChatRequest<'_>, stream: bool) -> Result<Value> {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(request.model));
        if stream {
            body.insert("stream".to_string(), json!(true));
        }
        common::merge_custom_params(
            &mut body,
            request.custom_params,
            &["model", "messages", "system", "stream"],
        )?;

        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        match request.max_tokens {
            Some(max_tokens) => {
                body.insert("max_tokens".to_string(), json!(max_tokens));
            }
            None => {
                body.entry("max_tokens").or_insert(json!(DEFAULT_MAX_TOKENS));
            }
        }
        if !request.system_role.is_empty() {
            body.insert("system".to_string(), json!(request.system_role));
        }
        body.insert(
            "messages".to_string(),
            json!([{"role": "user", "content": request.user_message}]),
        );
        Ok(Value::Object(body))
    }

    fn begin_parse(&mut self, body: &str) -> Result<ApiResponse> {
        self.state.reset();
        let doc = common::parse_json(body)?;
        if let Some(message) = common::api_error_message(&doc) {
            return Err(AiError::Api(message));
        }
        let response: ApiResponse = common::decode(doc)?;
        self.state.total_tokens = response.usage.map(|u| u.total());
        self.state.finish_reason = response.stop_reason.clone();
        Ok(response)
    }
}

impl Default for ClaudeHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenated text of all `text` content blocks.
fn text_blocks(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(feature = "tool-calls")]
fn tools_value(tools: &[String]) -> Result<Value> {
    let specs = common::parse_tools(tools)?;
    Ok(Value::Array(
        specs
            .into_iter()
            .map(|spec| {
                let mut tool = Map::new();
                tool.insert("name".to_string(), json!(spec.name));
                if let Some(description) = spec.description {
                    tool.insert("description".to_string(), json!(description));
                }
                tool.insert("input_schema".to_string(), spec.parameters);
                Value::Object(tool)
            })
            .collect(),
    ))
}

#[cfg(feature = "tool-calls")]
fn tool_choice_value(raw: &str) -> Option<Value> {
    let choice = match ToolChoice::parse(raw)? {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Any | ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::Object(value) => value,
        ToolChoice::Other(text) => {
            warn!(tool_choice = %text, "unrecognized tool_choice for Claude, forwarding as type");
            json!({"type": text})
        }
    };
    Some(choice)
}

#[cfg(feature = "tool-calls")]
fn tool_body(
    model: &str,
    system_role: &str,
    max_tokens: Option<u32>,
    tool_choice: &str,
    tools: &[String],
    messages: Vec<Value>,
) -> Result<String> {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert(
        "max_tokens".to_string(),
        json!(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if !system_role.is_empty() {
        body.insert("system".to_string(), json!(system_role));
    }
    body.insert("tools".to_string(), tools_value(tools)?);
    if let Some(choice) = tool_choice_value(tool_choice) {
        body.insert("tool_choice".to_string(), choice);
    }
    body.insert("messages".to_string(), Value::Array(messages));
    common::to_body(&Value::Object(body))
}

impl PlatformHandler for ClaudeHandler {
    fn platform(&self) -> Platform {
        Platform::Claude
    }

    fn endpoint(&self, _model: &str, _api_key: &str, custom_endpoint: &str) -> String {
        if custom_endpoint.is_empty() {
            CLAUDE_ENDPOINT.to_string()
        } else {
            custom_endpoint.to_string()
        }
    }

    fn set_headers(&self, transport: &mut dyn Transport, api_key: &str) {
        transport.set_header("Content-Type", "application/json");
        transport.set_header("x-api-key", api_key);
        transport.set_header("anthropic-version", ANTHROPIC_VERSION);
    }

    fn build_request_body(&self, request: &ChatRequest<'_>) -> Result<String> {
        common::to_body(&Self::chat_body(request, false)?)
    }

    fn parse_response_body(&mut self, body: &str) -> Result<String> {
        let response = self.begin_parse(body)?;
        match response.content {
            Some(content) if !content.is_empty() => Ok(text_blocks(&content)),
            _ => Err(AiError::Parse("No valid content in response".to_string())),
        }
    }

    fn exchange(&self) -> &ExchangeState {
        &self.state
    }

    fn exchange_mut(&mut self) -> &mut ExchangeState {
        &mut self.state
    }

    fn reset(&mut self) {
        self.state.reset();
        self.stream_input_tokens = 0;
    }

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_request_body(&self, request: &ToolCallsRequest<'_>) -> Result<String> {
        tool_body(
            request.model,
            request.system_role,
            request.max_tokens,
            request.tool_choice,
            request.tools,
            vec![json!({"role": "user", "content": request.user_message})],
        )
    }

    #[cfg(feature = "tool-calls")]
    fn parse_tool_calls_response_body(&mut self, body: &str) -> Result<ToolCallsReply> {
        let response = self.begin_parse(body)?;
        let content = response
            .content
            .ok_or_else(|| AiError::Parse("No content array found in response".to_string()))?;

        let calls: Vec<ToolCall> = content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    let id = id.clone().unwrap_or_else(common::generate_call_id);
                    let arguments = if input.is_object() {
                        input.to_string()
                    } else {
                        "{}".to_string()
                    };
                    Some(ToolCall::new(id, name.as_str(), arguments))
                }
                _ => None,
            })
            .collect();

        if calls.is_empty() {
            Ok(ToolCallsReply::Text(text_blocks(&content)))
        } else {
            Ok(ToolCallsReply::Calls(calls))
        }
    }

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_follow_up_request_body(
        &self,
        request: &FollowUpRequest<'_>,
    ) -> Result<String> {
        let tool_uses: Vec<Value> = request
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": call.arguments_value(),
                })
            })
            .collect();

        let tool_results: Vec<Value> = request
            .tool_results
            .iter()
            .map(|result| {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": result.tool_call_id,
                    "content": result.output,
                });
                if result.is_error {
                    block["is_error"] = json!(true);
                }
                block
            })
            .collect();

        tool_body(
            request.model,
            request.system_role,
            request.max_tokens,
            request.tool_choice,
            request.tools,
            vec![
                json!({"role": "user", "content": request.user_message}),
                json!({"role": "assistant", "content": tool_uses}),
                json!({"role": "user", "content": tool_results}),
            ],
        )
    }

    #[cfg(feature = "stream-chat")]
    fn build_stream_request_body(&self, request: &ChatRequest<'_>) -> Result<String> {
        common::to_body(&Self::chat_body(request, true)?)
    }

    #[cfg(feature = "stream-chat")]
    fn process_stream_chunk(&mut self, line: &str) -> Result<StreamChunk> {
        let Some(data) = common::sse_data(line) else {
            return Ok(StreamChunk::empty());
        };
        if data.is_empty() {
            return Ok(StreamChunk::empty());
        }

        let doc: Value = serde_json::from_str(data)
            .map_err(|e| AiError::json("Failed to parse Claude streaming chunk JSON", e))?;
        if let Some(message) = common::api_error_message(&doc) {
            return Err(AiError::Stream(format!("Stream error: {}", message)));
        }

        let event: StreamEvent = serde_json::from_value(doc)
            .map_err(|e| AiError::json("Failed to parse Claude streaming chunk JSON", e))?;
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.stream_input_tokens = usage.input_tokens.unwrap_or(0);
                    self.state.total_tokens = Some(self.stream_input_tokens);
                }
                Ok(StreamChunk::empty())
            }
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            } => Ok(StreamChunk::text(text)),
            StreamEvent::ContentBlockDelta { .. } => Ok(StreamChunk::empty()),
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.state.finish_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    let input = usage
                        .input_tokens
                        .filter(|&n| n > 0)
                        .unwrap_or(self.stream_input_tokens);
                    self.state.total_tokens = Some(input + usage.output_tokens.unwrap_or(0));
                }
                Ok(StreamChunk::empty())
            }
            StreamEvent::MessageStop => Ok(StreamChunk::complete()),
            StreamEvent::Error => Err(AiError::Stream("Unknown stream error".to_string())),
            StreamEvent::Other => Ok(StreamChunk::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(custom_params: &'a str, max_tokens: Option<u32>) -> ChatRequest<'a> {
        ChatRequest {
            model: "claude-sonnet-4-5",
            system_role: "You are terse.",
            temperature: Some(0.9),
            max_tokens,
            user_message: "Hello",
            custom_params,
        }
    }

    fn body_of(handler: &ClaudeHandler, request: &ChatRequest<'_>) -> Value {
        serde_json::from_str(&handler.build_request_body(request).unwrap()).unwrap()
    }

    #[test]
    fn test_build_request_body() {
        let handler = ClaudeHandler::new();
        let body = body_of(&handler, &request("", Some(120)));
        assert_eq!(body["temperature"], 0.9);
        assert_eq!(body["max_tokens"], 120);
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
    }

    #[test]
    fn test_max_tokens_always_present() {
        let handler = ClaudeHandler::new();
        let body = body_of(&handler, &request("", None));
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);

        let body = body_of(&handler, &request(r#"{"max_tokens": 300}"#, None));
        assert_eq!(body["max_tokens"], 300);

        let body = body_of(&handler, &request(r#"{"max_tokens": 300}"#, Some(50)));
        assert_eq!(body["max_tokens"], 50);
    }

    #[test]
    fn test_custom_params_cannot_replace_system() {
        let handler = ClaudeHandler::new();
        let body = body_of(
            &handler,
            &request(r#"{"system": "x", "top_k": 5, "temperature": 0.2}"#, None),
        );
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["top_k"], 5);
        assert_eq!(body["temperature"], 0.9);
    }

    #[test]
    fn test_parse_response_body() {
        let mut handler = ClaudeHandler::new();
        let body = r#"{
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " world"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }"#;
        assert_eq!(handler.parse_response_body(body).unwrap(), "Hello world");
        assert_eq!(handler.finish_reason(), Some("end_turn"));
        assert_eq!(handler.total_tokens(), Some(14));
    }

    #[test]
    fn test_parse_error_envelope() {
        let mut handler = ClaudeHandler::new();
        let body = r#"{"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}"#;
        assert_eq!(
            handler.parse_response_body(body).unwrap_err(),
            AiError::Api("Overloaded".to_string())
        );
        assert!(handler.parse_response_body(r#"{"content": []}"#).is_err());
    }

    #[cfg(feature = "tool-calls")]
    mod tool_calls {
        use super::*;
        use crate::types::ToolResult;

        const LED_TOOL: &str = r#"{"type":"function","function":{"name":"set_led","description":"Switch the LED","parameters":{"type":"object","properties":{"on":{"type":"boolean"}}}}}"#;

        #[test]
        fn test_tools_use_input_schema() {
            let handler = ClaudeHandler::new();
            let tools = vec![LED_TOOL.to_string()];
            let body = handler
                .build_tool_calls_request_body(&ToolCallsRequest {
                    model: "claude-sonnet-4-5",
                    system_role: "Home assistant",
                    max_tokens: None,
                    tool_choice: "required",
                    user_message: "Turn the light on",
                    tools: &tools,
                })
                .unwrap();
            let body: Value = serde_json::from_str(&body).unwrap();
            assert_eq!(body["tools"][0]["name"], "set_led");
            assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
            assert_eq!(body["tool_choice"], json!({"type": "any"}));
            assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
            assert_eq!(body["system"], "Home assistant");
        }

        #[test]
        fn test_parse_tool_use_blocks() {
            let mut handler = ClaudeHandler::new();
            let body = r#"{
                "content": [
                    {"type": "text", "text": "Switching it on."},
                    {"type": "tool_use", "id": "toolu_01", "name": "set_led", "input": {"on": true}}
                ],
                "stop_reason": "tool_use",
                "usage": {"input_tokens": 30, "output_tokens": 12}
            }"#;
            let reply = handler.parse_tool_calls_response_body(body).unwrap();
            assert_eq!(
                reply,
                ToolCallsReply::Calls(vec![ToolCall::new("toolu_01", "set_led", r#"{"on":true}"#)])
            );
            assert_eq!(handler.finish_reason(), Some("tool_use"));
            assert_eq!(handler.total_tokens(), Some(42));
        }

        #[test]
        fn test_follow_up_blocks() {
            let handler = ClaudeHandler::new();
            let tools = vec![LED_TOOL.to_string()];
            let calls = vec![ToolCall::new("toolu_01", "set_led", r#"{"on":true}"#)];
            let results = vec![ToolResult {
                tool_call_id: "toolu_01".to_string(),
                name: "set_led".to_string(),
                output: "relay failure".to_string(),
                is_error: true,
            }];
            let body = handler
                .build_tool_calls_follow_up_request_body(&FollowUpRequest {
                    model: "claude-sonnet-4-5",
                    system_role: "",
                    max_tokens: Some(256),
                    tool_choice: "auto",
                    initial_tool_choice: "",
                    user_message: "Turn the light on",
                    tools: &tools,
                    tool_calls: &calls,
                    tool_results: &results,
                })
                .unwrap();
            let body: Value = serde_json::from_str(&body).unwrap();
            let messages = body["messages"].as_array().unwrap();
            assert_eq!(messages[0]["content"], "Turn the light on");
            assert_eq!(messages[1]["role"], "assistant");
            assert_eq!(messages[1]["content"][0]["type"], "tool_use");
            assert_eq!(messages[1]["content"][0]["input"]["on"], true);
            assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_01");
            assert_eq!(messages[2]["content"][0]["is_error"], true);
            assert_eq!(body["tool_choice"], json!({"type": "auto"}));
            assert_eq!(body["max_tokens"], 256);
        }
    }

    #[cfg(feature = "stream-chat")]
    mod streaming {
        use super::*;

        #[test]
        fn test_stream_events() {
            let mut handler = ClaudeHandler::new();
            let start = r#"data: {"type":"message_start","message":{"usage":{"input_tokens":9,"output_tokens":1}}}"#;
            assert_eq!(handler.process_stream_chunk("event: message_start").unwrap(), StreamChunk::empty());
            assert_eq!(handler.process_stream_chunk(start).unwrap(), StreamChunk::empty());

            let delta = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
            assert_eq!(handler.process_stream_chunk(delta).unwrap(), StreamChunk::text("Hi"));

            let message_delta = r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#;
            handler.process_stream_chunk(message_delta).unwrap();
            assert_eq!(handler.finish_reason(), Some("end_turn"));
            assert_eq!(handler.total_tokens(), Some(14));

            let stop = r#"data: {"type":"message_stop"}"#;
            assert!(handler.process_stream_chunk(stop).unwrap().is_complete);
        }

        #[test]
        fn test_stream_output_tokens_counted_once() {
            let mut handler = ClaudeHandler::new();
            let start = r#"data: {"type":"message_start","message":{"usage":{"input_tokens":20,"output_tokens":3}}}"#;
            handler.process_stream_chunk(start).unwrap();
            assert_eq!(handler.total_tokens(), Some(20));

            let end = r#"data: {"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":40}}"#;
            handler.process_stream_chunk(end).unwrap();
            assert_eq!(handler.total_tokens(), Some(60));

            handler.reset();
            assert_eq!(handler.total_tokens(), None);
            handler.process_stream_chunk(end).unwrap();
            assert_eq!(handler.total_tokens(), Some(40));
        }

        #[test]
        fn test_stream_error_event() {
            let mut handler = ClaudeHandler::new();
            let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
            let err = handler.process_stream_chunk(line).unwrap_err();
            assert_eq!(err.to_string(), "Stream error: Overloaded");
        }

        #[test]
        fn test_stream_body_flag() {
            let handler = ClaudeHandler::new();
            let body: Value = serde_json::from_str(
                &handler.build_stream_request_body(&request("", None)).unwrap(),
            )
            .unwrap();
            assert_eq!(body["stream"], true);
            assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        }
    }
}
