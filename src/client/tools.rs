//! Two-phase tool calling: `tc_chat` asks the model, `tc_reply` answers the
//! tool calls it requested. Rounds can be chained for as long as the model
//! keeps asking for tools.

use tracing::debug;

use super::{check_status, post_json, AiClient};
use crate::error::{AiError, Result};
use crate::llm::{common, FollowUpRequest, ToolCallsReply, ToolCallsRequest};
use crate::types::{is_tool_call_finish, ToolCall, ToolCallConfig, ToolResult};

/// Registered tools, their configuration and the pending cycle.
#[derive(Debug, Clone, Default)]
pub(crate) struct ToolCallState {
    tools: Vec<String>,
    config: ToolCallConfig,
    /// User message of the current cycle, replayed in every follow-up.
    user_message: String,
    pending_calls: Vec<ToolCall>,
    awaiting_reply: bool,
    raw: String,
    chat_status: Option<u16>,
    reply_status: Option<u16>,
}

impl ToolCallState {
    fn clear_cycle(&mut self) {
        self.user_message.clear();
        self.pending_calls.clear();
        self.awaiting_reply = false;
        self.raw.clear();
        self.chat_status = None;
        self.reply_status = None;
    }
}

impl AiClient {
    /// Register tool definitions, each a JSON object with `name`,
    /// `parameters` and an optional `description`.
    ///
    /// On failure the previously registered tools are kept.
    pub fn set_tc_tools<S: AsRef<str>>(&mut self, tools: &[S]) -> Result<()> {
        self.last_error.clear();
        let tools: Vec<String> = tools.iter().map(|t| t.as_ref().to_string()).collect();
        let result = if tools.is_empty() {
            Err(AiError::Validation("Tool definitions must not be empty.".to_string()))
        } else {
            common::validate_tools(&tools, self.options.tool_budget()).map(|specs| {
                debug!(count = specs.len(), "tools registered");
                self.tc.tools = tools;
            })
        };
        self.record(result)
    }

    pub fn tc_tools(&self) -> &[String] {
        &self.tc.tools
    }

    pub fn set_tc_chat_system_role(&mut self, system_role: &str) {
        self.tc.config.system_role = system_role.to_string();
    }

    /// Zero is ignored.
    pub fn set_tc_chat_max_tokens(&mut self, max_tokens: u32) {
        if max_tokens > 0 {
            self.tc.config.max_tokens = Some(max_tokens);
        }
    }

    /// `auto`, `none`, `required`, `any` or a provider-specific JSON object.
    /// Empty leaves the choice to the provider.
    pub fn set_tc_chat_tool_choice(&mut self, tool_choice: &str) {
        self.tc.config.tool_choice = tool_choice.to_string();
    }

    /// Zero is ignored.
    pub fn set_tc_reply_max_tokens(&mut self, max_tokens: u32) {
        if max_tokens > 0 {
            self.tc.config.reply_max_tokens = Some(max_tokens);
        }
    }

    pub fn set_tc_reply_tool_choice(&mut self, tool_choice: &str) {
        self.tc.config.reply_tool_choice = tool_choice.to_string();
    }

    pub fn tc_chat_system_role(&self) -> &str {
        &self.tc.config.system_role
    }

    pub fn tc_chat_max_tokens(&self) -> Option<u32> {
        self.tc.config.max_tokens
    }

    pub fn tc_chat_tool_choice(&self) -> &str {
        &self.tc.config.tool_choice
    }

    pub fn tc_reply_max_tokens(&self) -> Option<u32> {
        self.tc.config.reply_max_tokens
    }

    pub fn tc_reply_tool_choice(&self) -> &str {
        &self.tc.config.reply_tool_choice
    }

    /// Raw body of the last `tc_chat` or `tc_reply` response.
    pub fn tc_raw_response(&self) -> &str {
        &self.tc.raw
    }

    pub fn tc_chat_response_code(&self) -> Option<u16> {
        self.tc.chat_status
    }

    pub fn tc_reply_response_code(&self) -> Option<u16> {
        self.tc.reply_status
    }

    /// Whether the last response asked for tool calls, so `tc_reply` is allowed.
    pub fn has_pending_tool_calls(&self) -> bool {
        self.tc.awaiting_reply
    }

    /// Start a tool-calling cycle.
    ///
    /// Returns the requested tool calls as a JSON array when the model
    /// wants tools run, otherwise its text answer.
    pub fn tc_chat(&mut self, user_message: &str) -> Result<String> {
        self.last_error.clear();
        let result = self.run_tc_chat(user_message);
        self.record(result)
    }

    fn run_tc_chat(&mut self, user_message: &str) -> Result<String> {
        self.tc.clear_cycle();
        let handler = self.handler.as_mut().ok_or(AiError::NotInitialized)?;
        if self.tc.tools.is_empty() {
            return Err(AiError::Config(
                "Tool calls not set up. Call set_tc_tools() first.".to_string(),
            ));
        }
        self.tc.user_message = user_message.to_string();

        let url = handler.endpoint(&self.model, &self.api_key, &self.custom_endpoint);
        let body = handler.build_tool_calls_request_body(&ToolCallsRequest {
            model: &self.model,
            system_role: &self.tc.config.system_role,
            max_tokens: self.tc.config.max_tokens,
            tool_choice: &self.tc.config.tool_choice,
            user_message,
            tools: &self.tc.tools,
        })?;
        trace_exchange!(url = %url, body = %body, "tool call request");

        let (status, response) = post_json(
            self.transport.as_mut(),
            &**handler,
            &self.api_key,
            self.options.http_timeout,
            &url,
            &body,
        )?;
        self.tc.chat_status = Some(status);
        self.tc.raw = response;
        check_status(status, &self.tc.raw)?;

        let reply = handler.parse_tool_calls_response_body(&self.tc.raw)?;
        self.settle(reply)
    }

    /// Answer the pending tool calls with `results_json`, a JSON array of
    /// `{"tool_call_id", "function": {"name", "output"}}` objects.
    ///
    /// The response is handled like `tc_chat`'s, so it may request
    /// another round.
    pub fn tc_reply(&mut self, results_json: &str) -> Result<String> {
        self.last_error.clear();
        let result = self.run_tc_reply(results_json);
        self.record(result)
    }

    fn run_tc_reply(&mut self, results_json: &str) -> Result<String> {
        if !self.tc.awaiting_reply {
            return Err(AiError::Config(
                "No tool calls to reply to. Call tc_chat first and ensure it returns tool calls."
                    .to_string(),
            ));
        }
        let handler = self.handler.as_mut().ok_or(AiError::NotInitialized)?;

        let budget = self.options.tool_budget();
        if results_json.len() > budget {
            return Err(AiError::Validation(format!(
                "Tool results JSON too large. Maximum size: {} bytes.",
                budget
            )));
        }
        let results = ToolResult::parse_list(results_json)?;

        let url = handler.endpoint(&self.model, &self.api_key, &self.custom_endpoint);
        let body = handler.build_tool_calls_follow_up_request_body(&FollowUpRequest {
            model: &self.model,
            system_role: &self.tc.config.system_role,
            max_tokens: self.tc.config.reply_max_tokens,
            tool_choice: &self.tc.config.reply_tool_choice,
            initial_tool_choice: &self.tc.config.tool_choice,
            user_message: &self.tc.user_message,
            tools: &self.tc.tools,
            tool_calls: &self.tc.pending_calls,
            tool_results: &results,
        })?;
        trace_exchange!(url = %url, body = %body, "tool reply request");

        self.tc.reply_status = None;
        let (status, response) = post_json(
            self.transport.as_mut(),
            &**handler,
            &self.api_key,
            self.options.http_timeout,
            &url,
            &body,
        )?;
        self.tc.reply_status = Some(status);
        self.tc.raw = response;
        check_status(status, &self.tc.raw)?;

        let reply = handler.parse_tool_calls_response_body(&self.tc.raw)?;
        self.settle(reply)
    }

    /// Record the outcome of a tool-calling exchange and render it for the
    /// caller.
    fn settle(&mut self, reply: ToolCallsReply) -> Result<String> {
        self.tc.awaiting_reply = self.finish_reason().is_some_and(is_tool_call_finish);
        debug!(awaiting_reply = self.tc.awaiting_reply, "tool call exchange settled");
        match reply {
            ToolCallsReply::Calls(calls) => {
                let rendered = ToolCall::to_json_list(&calls)?;
                self.tc.pending_calls = calls;
                Ok(rendered)
            }
            ToolCallsReply::Text(text) => {
                self.tc.pending_calls.clear();
                Ok(text)
            }
        }
    }

    /// Clear tool-call configuration and the current cycle. Registered
    /// tools are kept.
    pub fn tc_chat_reset(&mut self) {
        self.tc.config.reset();
        self.tc.clear_cycle();
    }
}

#[cfg(test)]
mod tests {
    use crate::client::test_support::{mock_client, mock_client_with};
    use crate::client::AiClient;
    use crate::config::ClientOptions;
    use crate::error::AiError;
    use crate::transport::mock::MockResponse;
    use crate::types::ToolCall;

    const WEATHER_TOOL: &str = r#"{
        "name": "get_weather",
        "description": "Current weather for a city",
        "parameters": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
    }"#;

    const OPENAI_CALLS: &str = r#"{
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"total_tokens": 40}
    }"#;

    const OPENAI_TEXT: &str = r#"{
        "choices": [{"message": {"role": "assistant", "content": "It is sunny in Paris."}, "finish_reason": "stop"}],
        "usage": {"total_tokens": 55}
    }"#;

    const RESULTS: &str = r#"[{"tool_call_id": "call_1", "function": {"name": "get_weather", "output": "sunny, 21C"}}]"#;

    #[test]
    fn test_full_cycle() {
        let (mut client, transport) = mock_client(
            "openai",
            vec![MockResponse::json(200, OPENAI_CALLS), MockResponse::json(200, OPENAI_TEXT)],
        );
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();
        client.set_tc_chat_tool_choice("auto");

        let calls = ToolCall::parse_list(&client.tc_chat("Weather in Paris?").unwrap()).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].arguments_value()["city"], "Paris");
        assert!(client.has_pending_tool_calls());
        assert_eq!(client.tc_chat_response_code(), Some(200));

        let first = transport.last_request().json();
        assert_eq!(first["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(first["tool_choice"], "auto");

        let answer = client.tc_reply(RESULTS).unwrap();
        assert_eq!(answer, "It is sunny in Paris.");
        assert!(!client.has_pending_tool_calls());
        assert_eq!(client.tc_reply_response_code(), Some(200));
        assert_eq!(client.tc_raw_response(), OPENAI_TEXT);
        assert_eq!(client.total_tokens(), Some(55));

        let follow_up = transport.last_request().json();
        let messages = follow_up["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"], "Weather in Paris?");
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
        assert_eq!(messages[2]["content"], "sunny, 21C");
        assert!(follow_up["tools"].is_array());
    }

    #[test]
    fn test_reply_without_pending_calls() {
        let (mut client, transport) = mock_client("openai", vec![MockResponse::json(200, OPENAI_TEXT)]);
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();

        let err = client.tc_reply(RESULTS).unwrap_err();
        assert!(matches!(err, AiError::Config(_)));
        assert!(client.last_error().starts_with("No tool calls to reply to"));
        assert_eq!(transport.request_count(), 0);

        assert_eq!(client.tc_chat("Hello").unwrap(), "It is sunny in Paris.");
        assert!(!client.has_pending_tool_calls());
        assert!(client.tc_reply(RESULTS).is_err());
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_tc_chat_requires_tools() {
        let (mut client, transport) = mock_client("openai", vec![]);
        let err = client.tc_chat("Hello").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Tool calls not set up. Call set_tc_tools() first."
        );
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_invalid_tools_keep_previous_set() {
        let (mut client, _) = mock_client("openai", vec![]);
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();

        let err = client
            .set_tc_tools(&[WEATHER_TOOL, r#"{"name": "broken"}"#])
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing 'parameters' field in tool #2");
        assert_eq!(client.tc_tools().len(), 1);

        assert!(client.set_tc_tools(&["not json"]).is_err());
        assert!(client.last_error().starts_with("Invalid JSON in tool #1"));
        assert_eq!(client.tc_tools()[0], WEATHER_TOOL);
    }

    #[test]
    fn test_tools_over_budget() {
        let options = ClientOptions {
            request_buffer_size: 100,
            ..ClientOptions::default()
        };
        let (mut client, _) = mock_client_with("openai", vec![], options);
        let err = client.set_tc_tools(&[WEATHER_TOOL]).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Tool calls definition too large."));
        assert!(err.to_string().contains("maximum allowed: 50 bytes"));
        assert!(client.tc_tools().is_empty());
    }

    #[test]
    fn test_malformed_results_rejected_before_io() {
        let (mut client, transport) = mock_client("openai", vec![MockResponse::json(200, OPENAI_CALLS)]);
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();
        client.tc_chat("Weather in Paris?").unwrap();

        let err = client
            .tc_reply(r#"[{"tool_call_id": "call_1", "function": {"name": "get_weather"}}]"#)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Each tool result function must have an 'output' field."
        );
        assert!(client.tc_reply(r#"{"tool_call_id": "call_1"}"#).is_err());
        assert_eq!(transport.request_count(), 1);
        assert!(client.has_pending_tool_calls());
    }

    #[test]
    fn test_chained_rounds() {
        let (mut client, transport) = mock_client(
            "openai",
            vec![
                MockResponse::json(200, OPENAI_CALLS),
                MockResponse::json(200, OPENAI_CALLS),
                MockResponse::json(200, OPENAI_TEXT),
            ],
        );
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();
        client.set_tc_reply_max_tokens(64);
        client.set_tc_reply_tool_choice("none");

        client.tc_chat("Weather in Paris twice?").unwrap();
        let again = client.tc_reply(RESULTS).unwrap();
        assert!(again.starts_with('['));
        assert!(client.has_pending_tool_calls());

        let follow_up = transport.last_request().json();
        assert_eq!(follow_up["max_completion_tokens"], 64);
        assert_eq!(follow_up["tool_choice"], "none");

        assert_eq!(client.tc_reply(RESULTS).unwrap(), "It is sunny in Paris.");
        assert!(!client.has_pending_tool_calls());
        assert_eq!(transport.request_count(), 3);
    }

    #[test]
    fn test_claude_cycle_forwards_error_flag() {
        let calls = r#"{
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 10}
        }"#;
        let (mut client, transport) = mock_client("claude", vec![MockResponse::json(200, calls)]);
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();

        let returned = ToolCall::parse_list(&client.tc_chat("Weather?").unwrap()).unwrap();
        assert_eq!(returned[0].id, "toolu_1");
        assert!(client.has_pending_tool_calls());
        assert_eq!(client.finish_reason(), Some("tool_use"));

        transport.push(MockResponse::json(
            200,
            r#"{"content":[{"type":"text","text":"Lookup failed."}],"stop_reason":"end_turn"}"#,
        ));
        let results = r#"[{"tool_call_id": "toolu_1", "function": {"name": "get_weather", "output": "timeout"}, "is_error": true}]"#;
        assert_eq!(client.tc_reply(results).unwrap(), "Lookup failed.");

        let body = transport.last_request().json();
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        let block = &body["messages"][2]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "toolu_1");
        assert_eq!(block["is_error"], true);
    }

    #[test]
    fn test_zero_token_limits_ignored() {
        let (mut client, _) = mock_client("openai", vec![]);
        client.set_tc_chat_max_tokens(200);
        client.set_tc_chat_max_tokens(0);
        client.set_tc_reply_max_tokens(0);
        assert_eq!(client.tc_chat_max_tokens(), Some(200));
        assert_eq!(client.tc_reply_max_tokens(), None);
    }

    #[test]
    fn test_reset_keeps_tools() {
        let (mut client, _) = mock_client("openai", vec![MockResponse::json(200, OPENAI_CALLS)]);
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();
        client.set_tc_chat_system_role("You are a weather bot");
        client.set_tc_chat_tool_choice("required");
        client.set_tc_reply_tool_choice("auto");
        client.tc_chat("Weather?").unwrap();

        client.tc_chat_reset();
        assert_eq!(client.tc_tools().len(), 1);
        assert_eq!(client.tc_chat_system_role(), "");
        assert_eq!(client.tc_chat_tool_choice(), "");
        assert_eq!(client.tc_reply_tool_choice(), "");
        assert_eq!(client.tc_chat_max_tokens(), None);
        assert_eq!(client.tc_raw_response(), "");
        assert_eq!(client.tc_chat_response_code(), None);
        assert!(!client.has_pending_tool_calls());
        assert!(client.tc_reply(RESULTS).is_err());
    }

    #[test]
    fn test_reset_twice_matches_reset_once() {
        let (mut client, _) = mock_client("openai", vec![MockResponse::json(200, OPENAI_CALLS)]);
        client.set_tc_tools(&[WEATHER_TOOL]).unwrap();
        client.set_tc_chat_max_tokens(300);
        client.set_tc_reply_max_tokens(80);
        client.tc_chat("Weather?").unwrap();

        let snapshot = |client: &AiClient| {
            (
                client.tc_tools().to_vec(),
                client.tc_chat_system_role().to_string(),
                client.tc_chat_max_tokens(),
                client.tc_reply_max_tokens(),
                client.tc_chat_tool_choice().to_string(),
                client.tc_raw_response().to_string(),
                client.tc_chat_response_code(),
                client.tc_reply_response_code(),
                client.has_pending_tool_calls(),
            )
        };

        client.tc_chat_reset();
        let once = snapshot(&client);
        client.tc_chat_reset();
        assert_eq!(snapshot(&client), once);
        assert_eq!(once.2, None);
        assert!(!once.8);
    }
}
