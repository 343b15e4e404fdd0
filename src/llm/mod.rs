//! Platform handlers.
//!
//! This module defines the `PlatformHandler` trait that abstracts over the
//! supported LLM APIs, the handler registry, and one implementation per
//! provider. Handlers are pure translators: they build request bodies and
//! parse response bodies, and never touch the network themselves. The only
//! state they keep is the finish reason and token total of the last parse.

pub mod common;

#[cfg(any(feature = "openai", feature = "deepseek"))]
pub mod openai_compatible;

#[cfg(feature = "deepseek")]
pub mod deepseek;

#[cfg(feature = "claude")]
pub mod anthropic;

#[cfg(feature = "gemini")]
pub mod gemini;

use std::fmt;
use std::str::FromStr;

use crate::error::{AiError, Result};
use crate::transport::Transport;
#[cfg(feature = "tool-calls")]
use crate::types::{ToolCall, ToolResult};

use common::ExchangeState;

/// The closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    OpenAi,
    DeepSeek,
    Gemini,
    Claude,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::OpenAi => "openai",
            Platform::DeepSeek => "deepseek",
            Platform::Gemini => "gemini",
            Platform::Claude => "claude",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = AiError;

    /// Case-insensitive lookup of a platform identifier.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" => Ok(Platform::OpenAi),
            "deepseek" => Ok(Platform::DeepSeek),
            "gemini" => Ok(Platform::Gemini),
            "claude" => Ok(Platform::Claude),
            _ => Err(AiError::UnsupportedPlatform(s.to_string())),
        }
    }
}

/// Normalized parameters of a plain or streaming chat request.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system_role: &'a str,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub user_message: &'a str,
    /// JSON object text, possibly empty.
    pub custom_params: &'a str,
}

/// Parameters of the initial tool-calling request.
#[cfg(feature = "tool-calls")]
#[derive(Debug, Clone, Copy)]
pub struct ToolCallsRequest<'a> {
    pub model: &'a str,
    pub system_role: &'a str,
    pub max_tokens: Option<u32>,
    pub tool_choice: &'a str,
    pub user_message: &'a str,
    /// Raw tool definitions as registered by the caller.
    pub tools: &'a [String],
}

/// Parameters of the follow-up request carrying tool results.
#[cfg(feature = "tool-calls")]
#[derive(Debug, Clone, Copy)]
pub struct FollowUpRequest<'a> {
    pub model: &'a str,
    pub system_role: &'a str,
    pub max_tokens: Option<u32>,
    pub tool_choice: &'a str,
    /// Choice used by the initial request; only Gemini falls back to it.
    pub initial_tool_choice: &'a str,
    pub user_message: &'a str,
    pub tools: &'a [String],
    /// The assistant's pending directive being answered.
    pub tool_calls: &'a [ToolCall],
    pub tool_results: &'a [ToolResult],
}

/// What a tool-calling exchange produced.
#[cfg(feature = "tool-calls")]
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallsReply {
    Calls(Vec<ToolCall>),
    Text(String),
}

/// Result of feeding one stream line to a handler.
#[cfg(feature = "stream-chat")]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Text carried by this line only.
    pub content: String,
    pub is_complete: bool,
}

#[cfg(feature = "stream-chat")]
impl StreamChunk {
    pub(crate) fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_complete: false,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn complete() -> Self {
        Self {
            content: String::new(),
            is_complete: true,
        }
    }
}

/// Trait that all platform handlers implement.
///
/// The client owns exactly one handler; switching platforms replaces it.
pub trait PlatformHandler: Send {
    fn platform(&self) -> Platform;

    /// Default endpoint, unless `custom_endpoint` is non-empty.
    fn endpoint(&self, model: &str, api_key: &str, custom_endpoint: &str) -> String;

    /// Apply authentication and content-type headers.
    fn set_headers(&self, transport: &mut dyn Transport, api_key: &str);

    fn build_request_body(&self, request: &ChatRequest<'_>) -> Result<String>;

    /// Parse a plain chat response into its text content.
    fn parse_response_body(&mut self, body: &str) -> Result<String>;

    fn exchange(&self) -> &ExchangeState;

    fn exchange_mut(&mut self) -> &mut ExchangeState;

    /// Finish reason of the last parse, `None` before any.
    fn finish_reason(&self) -> Option<&str> {
        self.exchange().finish_reason.as_deref()
    }

    /// Token total of the last parse, `None` before any.
    fn total_tokens(&self) -> Option<u64> {
        self.exchange().total_tokens
    }

    fn reset(&mut self) {
        self.exchange_mut().reset();
    }

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_request_body(&self, request: &ToolCallsRequest<'_>) -> Result<String>;

    #[cfg(feature = "tool-calls")]
    fn parse_tool_calls_response_body(&mut self, body: &str) -> Result<ToolCallsReply>;

    #[cfg(feature = "tool-calls")]
    fn build_tool_calls_follow_up_request_body(
        &self,
        request: &FollowUpRequest<'_>,
    ) -> Result<String>;

    /// Streaming endpoint; most providers reuse the chat endpoint.
    #[cfg(feature = "stream-chat")]
    fn stream_endpoint(&self, model: &str, api_key: &str, custom_endpoint: &str) -> String {
        self.endpoint(model, api_key, custom_endpoint)
    }

    #[cfg(feature = "stream-chat")]
    fn build_stream_request_body(&self, request: &ChatRequest<'_>) -> Result<String>;

    /// Parse one raw stream line. Framing lines yield an empty chunk.
    #[cfg(feature = "stream-chat")]
    fn process_stream_chunk(&mut self, line: &str) -> Result<StreamChunk>;
}

/// Construct the handler for `identifier`.
///
/// Unknown identifiers and providers compiled out of this build are both
/// reported as [`AiError::UnsupportedPlatform`].
pub fn create_handler(identifier: &str) -> Result<Box<dyn PlatformHandler>> {
    let platform: Platform = identifier.parse()?;
    tracing::debug!(platform = %platform, "creating platform handler");

    #[allow(unreachable_patterns)]
    match platform {
        #[cfg(feature = "openai")]
        Platform::OpenAi => Ok(Box::new(openai_compatible::OpenAiCompatibleHandler::new())),
        #[cfg(feature = "deepseek")]
        Platform::DeepSeek => Ok(Box::new(deepseek::handler())),
        #[cfg(feature = "gemini")]
        Platform::Gemini => Ok(Box::new(gemini::GeminiHandler::new())),
        #[cfg(feature = "claude")]
        Platform::Claude => Ok(Box::new(anthropic::ClaudeHandler::new())),
        _ => Err(AiError::UnsupportedPlatform(identifier.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse_is_case_insensitive() {
        assert_eq!("OpenAI".parse::<Platform>().unwrap(), Platform::OpenAi);
        assert_eq!("openai-compatible".parse::<Platform>().unwrap(), Platform::OpenAi);
        assert_eq!("GEMINI".parse::<Platform>().unwrap(), Platform::Gemini);
        assert_eq!("Claude".parse::<Platform>().unwrap(), Platform::Claude);
        assert_eq!("DeepSeek".parse::<Platform>().unwrap(), Platform::DeepSeek);
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = create_handler("mistral").err().unwrap();
        assert_eq!(err, AiError::UnsupportedPlatform("mistral".to_string()));
        assert!(err.to_string().contains("not supported"));
    }

    #[cfg(all(feature = "openai", feature = "gemini", feature = "claude", feature = "deepseek"))]
    #[test]
    fn test_create_handler_for_each_platform() {
        for (id, platform) in [
            ("openai", Platform::OpenAi),
            ("deepseek", Platform::DeepSeek),
            ("gemini", Platform::Gemini),
            ("claude", Platform::Claude),
        ] {
            let handler = create_handler(id).unwrap();
            assert_eq!(handler.platform(), platform);
            assert_eq!(handler.finish_reason(), None);
            assert_eq!(handler.total_tokens(), None);
        }
    }
}
