//! Google Gemini (generateContent) platform handler.
//!
//! Gemini differs from the chat-completions family in most respects: the key
//! travels in the URL, generation parameters nest under `generationConfig`,
//! the system prompt is a `systemInstruction`, turns are `contents` with
//! `user`/`model` roles, schema types are upper-case, and streaming is
//! selected by endpoint rather than by a body flag.

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
use crate::types::{ToolCall, ToolChoice, FINISH_TOOL_CALLS};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

// --- Response types ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    parts: Option<Vec<Part>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    #[cfg(feature = "tool-calls")]
    function_call: Option<FunctionCallPart>,
}

#[cfg(feature = "tool-calls")]
#[derive(Deserialize, Debug)]
struct FunctionCallPart {
    #[serde(default)]
    name: String,
    args: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u64>,
}

impl Candidate {
    fn parts(&self) -> Option<&[Part]> {
        self.content.as_ref()?.parts.as_deref()
    }
}

/// Custom parameters that belong inside `generationConfig`.
const GENERATION_CONFIG_KEYS: &[&str] = &[
    "temperature",
    "topP",
    "topK",
    "maxOutputTokens",
    "candidateCount",
    "stopSequences",
    "responseMimeType",
    "responseSchema",
    "presencePenalty",
    "frequencyPenalty",
    "seed",
    "responseLogprobs",
    "logprobs",
    "enableEnhancedCivicAnswers",
    "speechConfig",
    "thinkingConfig",
    "mediaResolution",
];

/// Top-level keys the handler computes itself.
const RESERVED_KEYS: &[&str] = &["model", "contents", "systemInstruction", "stream"];

/// Finish reasons under which a candidate's content is usable.
const CLEAN_FINISH_REASONS: &[&str] = &["STOP", "MAX_TOKENS"];

pub struct GeminiHandler {
    state: ExchangeState,
}

impl GeminiHandler {
    pub fn new() -> Self {
        Self {
            state: ExchangeState::default(),
        }
    }

    fn chat_body(request: &ChatRequest<'_>) -> Result<Value> {
        let mut body = Map::new();
        if let Some(instruction) = system_instruction(request.system_role) {
            body.insert("systemInstruction".to_string(), instruction);
        }
        body.insert(
            "contents".to_string(),
            json!([user_text(request.user_message)]),
        );

        let mut generation_config = Map::new();
        for (key, value) in common::custom_param_entries(request.custom_params)? {
            if GENERATION_CONFIG_KEYS.contains(&key.as_str()) {
                generation_config.insert(key, value);
            } else if key == "generationConfig" {
                if let Value::Object(nested) = value {
                    generation_config.extend(nested);
                }
            } else if !RESERVED_KEYS.contains(&key.as_str()) {
                body.insert(key, value);
            }
        }

        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            body.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        Ok(Value::Object(body))
    }

    /// Reset state, decode, reject error envelopes and record usage.
    fn begin_parse(&mut self, body: &str) -> Result<ApiResponse> {
        self.state.reset();
        let doc = common::parse_json(body)?;
        if let Some(message) = common::api_error_message(&doc) {
            return Err(AiError::Api(message));
        }
        let response: ApiResponse = common::decode(doc)?;
        self.record_usage(&response);
        Ok(response)
    }

    fn record_usage(&mut self, response: &ApiResponse) {
        if let Some(total) = response
            .usage_metadata
            .as_ref()
            .and_then(|usage| usage.total_token_count)
        {
            self.state.total_tokens = Some(total);
        }
    }

    /// The first candidate, or the reason the prompt produced none.
    fn first_candidate(response: ApiResponse) -> Result<Candidate> {
        let feedback = response.prompt_feedback;
        if let Some(candidate) = response.candidates.into_iter().next() {
            return Ok(candidate);
        }
        match feedback {
            Some(PromptFeedback {
                block_reason: Some(reason),
            }) => Err(AiError::Parse(format!(
                "Gemini prompt blocked. Reason: {}",
                reason
            ))),
            Some(_) => Err(AiError::Parse(
                "Response missing 'candidates' and 'error', contains 'promptFeedback'.".to_string(),
            )),
            None => Err(AiError::Parse(
                "Invalid Gemini response format: Missing 'candidates', 'error', or 'promptFeedback'."
                    .to_string(),
            )),
        }
    }
}

impl Default for GeminiHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn system_instruction(system_role: &str) -> Option<Value> {
    if system_role.is_empty() {
        None
    } else {
        Some(json!({"parts": [{"text": system_role}]}))
    }
}

fn user_text(text: &str) -> Value {
    json!({"role": "user", "parts": [{"text": text}]})
}

/// Concatenated `text` of a candidate's parts, `None` if there is none.
fn candidate_text(candidate: &Candidate) -> Option<String> {
    let texts: Vec<&str> = candidate
        .parts()?
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.concat())
    }
}

/// Upper-case every string `type` in a JSON schema, recursively.
#[cfg(feature = "tool-calls")]
fn to_gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let converted = match (key.as_str(), value) {
                        ("type", Value::String(kind)) => Value::String(kind.to_uppercase()),
                        _ => to_gemini_schema(value),
                    };
                    (key.clone(), converted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(to_gemini_schema).collect()),
        other => other.clone(),
    }
}

#[cfg(feature = "tool-calls")]
fn tools_value(tools: &[String]) -> Result<Value> {
    let declarations: Vec<Value> = common::parse_tools(tools)?
        .into_iter()
        .map(|spec| {
            let mut declaration = Map::new();
            declaration.insert("name".to_string(), json!(spec.name));
            if let Some(description) = spec.description.filter(|d| !d.is_empty()) {
                declaration.insert("description".to_string(), json!(description));
            }
            declaration.insert("parameters".to_string(), to_gemini_schema(&spec.parameters));
            Value::Object(declaration)
        })
        .collect();
    Ok(json!([{"functionDeclarations": declarations}]))
}

/// Map a tool-choice directive onto `tool_config`.
#[cfg(feature = "tool-calls")]
fn tool_config_value(raw: &str) -> Option<Value> {
    let calling_config = match ToolChoice::parse(raw)? {
        ToolChoice::Auto => json!({"mode": "AUTO"}),
        ToolChoice::None => json!({"mode": "NONE"}),
        ToolChoice::Required | ToolChoice::Any => json!({"mode": "ANY"}),
        ToolChoice::Object(value) if value.get("type").and_then(Value::as_str) == Some("function") => {
            match value.pointer("/function/name").and_then(Value::as_str) {
                Some(name) => json!({"mode": "ANY", "allowed_function_names": [name]}),
                None => json!({"mode": "ANY"}),
            }
        }
        other => {
            warn!(tool_choice = ?other, "unsupported tool_choice value for Gemini, ignoring");
            return None;
        }
    };
    Some(json!({"function_calling_config": calling_config}))
}

#[cfg(feature = "tool-calls")]
fn tool_body(
    system_role: &str,
    max_tokens: Option<u32>,
    tool_choice: &str,
    tools: &[String],
    contents: Vec<Value>,
) -> Result<String> {
    let mut body = Map::new();
    if let Some(instruction) = system_instruction(system_role) {
        body.insert("systemInstruction".to_string(), instruction);
    }
    if let Some(max_tokens) = max_tokens {
        body.insert(
            "generationConfig".to_string(),
            json!({"maxOutputTokens": max_tokens}),
        );
    }
    body.insert("contents".to_string(), Value::Array(contents));
    body.insert("tools".to_string(), tools_value(tools)?);
    if let Some(config) = tool_config_value(tool_choice) {
        body.insert("tool_config".to_string(), config);
    }
    common::to_body(&Value::Object(body))
}

impl PlatformHandler for GeminiHandler {
    fn platform(&self) -> Platform {
        Platform::Gemini
    }

    fn endpoint(&self, model: &str, api_key: &str, custom_endpoint: &str) -> String {
        if !custom_endpoint.is_empty() {
            return custom_endpoint.to_string();
        }
        format!("{}/{}:generateContent?key={}", GEMINI_API_BASE, model, api_key)
    }

    /// The key is carried in the URL.
    fn set_headers(&self, transport: &mut dyn Transport, _api_key: &str) {
        transport.set_header("Content-Type", "application/json");
    }

    fn build_request_body(&self, request: &ChatRequest<'_>) -> Result<String> {
        common::to_body(&Self::chat_body(request)?)
    }

    fn parse_response_body(&mut self, body: &str) -> Result<String> {
        let response = self.begin_parse(body)?;
        let candidate = Self::first_candidate(response)?;

        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.state.finish_reason = Some(reason.to_string());
            if !CLEAN_FINISH_REASONS.contains(&reason) {
                return Err(AiError::Parse(format!(
                    "Gemini response stopped. Reason: {}",
                    reason
                )));
            }
        }

        if candidate.content.is_none() {
            return Err(AiError::Parse(
                "Could not find 'content' object in response 'candidates'.".to_string(),
            ));
        }
        candidate_text(&candidate).ok_or_else(|| {
            AiError::Parse("Could not find 'text' field in response 'parts'.".to_string())
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
        tool_body(
            request.system_role,
            request.max_tokens,
            request.tool_choice,
            request.tools,
            vec![user_text(request.user_message)],
        )
    }

    #[cfg(feature = "tool-calls")]
    fn parse_tool_calls_response_body(&mut self, body: &str) -> Result<ToolCallsReply> {
        let response = self.begin_parse(body)?;
        let candidate = Self::first_candidate(response)?;
        let parts = candidate.parts().ok_or_else(|| {
            AiError::Parse("Could not find 'parts' array in response 'content'".to_string())
        })?;

        // Gemini does not assign call ids, so generate them.
        let calls: Vec<ToolCall> = parts
            .iter()
            .filter_map(|part| part.function_call.as_ref())
            .map(|call| {
                let arguments = call
                    .args
                    .as_ref()
                    .filter(|args| !args.is_null())
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string());
                ToolCall::new(common::generate_call_id(), call.name.as_str(), arguments)
            })
            .collect();

        if !calls.is_empty() {
            self.state.finish_reason = Some(FINISH_TOOL_CALLS.to_string());
            return Ok(ToolCallsReply::Calls(calls));
        }

        match candidate_text(&candidate) {
            Some(text) => {
                self.state.finish_reason = Some("stop".to_string());
                Ok(ToolCallsReply::Text(text))
            }
            None => Err(AiError::Parse(
                "Response contained neither function calls nor text content".to_string(),
            )),
        }
    }

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_follow_up_request_body(
        &self,
        request: &FollowUpRequest<'_>,
    ) -> Result<String> {
        let mut call_parts: Vec<Value> = request
            .tool_calls
            .iter()
            .map(|call| {
                json!({"functionCall": {
                    "name": call.function.name,
                    "args": call.arguments_value(),
                }})
            })
            .collect();
        if call_parts.is_empty() {
            call_parts.push(json!({"text": ""}));
        }

        let response_parts: Vec<Value> = request
            .tool_results
            .iter()
            .map(|result| {
                let content = serde_json::from_str::<Value>(&result.output)
                    .unwrap_or_else(|_| Value::String(result.output.clone()));
                json!({"functionResponse": {
                    "name": result.name,
                    "response": {"content": content},
                }})
            })
            .collect();

        let tool_choice = if request.tool_choice.trim().is_empty() {
            request.initial_tool_choice
        } else {
            request.tool_choice
        };

        tool_body(
            request.system_role,
            request.max_tokens,
            tool_choice,
            request.tools,
            vec![
                user_text(request.user_message),
                json!({"role": "model", "parts": call_parts}),
                json!({"role": "user", "parts": response_parts}),
            ],
        )
    }

    #[cfg(feature = "stream-chat")]
    fn stream_endpoint(&self, model: &str, api_key: &str, custom_endpoint: &str) -> String {
        if !custom_endpoint.is_empty() {
            return custom_endpoint.to_string();
        }
        format!(
            "{}/{}:streamGenerateContent?alt=sse&key={}",
            GEMINI_API_BASE, model, api_key
        )
    }

    /// Identical to the plain body: streaming is selected by the endpoint.
    #[cfg(feature = "stream-chat")]
    fn build_stream_request_body(&self, request: &ChatRequest<'_>) -> Result<String> {
        common::to_body(&Self::chat_body(request)?)
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
            .map_err(|e| AiError::json("Failed to parse Gemini streaming chunk JSON", e))?;
        if let Some(message) = common::api_error_message(&doc) {
            return Err(AiError::Api(message));
        }
        let response: ApiResponse = common::decode(doc)?;
        self.record_usage(&response);

        let mut chunk = StreamChunk::empty();
        if let Some(candidate) = response.candidates.first() {
            if let Some(reason) = candidate.finish_reason.as_deref() {
                if !reason.is_empty() && reason != "FINISH_REASON_UNSPECIFIED" {
                    self.state.finish_reason = Some(reason.to_string());
                    chunk.is_complete = true;
                }
            }
            if let Some(text) = candidate_text(candidate) {
                chunk.content = text;
            }
        }
        Ok(chunk)
    }
}
