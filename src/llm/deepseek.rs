//! DeepSeek platform handler.
//!
//! DeepSeek's API is a chat-completions clone; the only differences are the
//! endpoint and the classic `max_tokens` limit field.

use super::openai_compatible::{Dialect, OpenAiCompatibleHandler};
use super::Platform;

pub const DEEPSEEK_ENDPOINT: &str = "https://api.deepseek.com/chat/completions";

pub const DIALECT: Dialect = Dialect {
    platform: Platform::DeepSeek,
    default_endpoint: DEEPSEEK_ENDPOINT,
    max_tokens_field: "max_tokens",
};

pub fn handler() -> OpenAiCompatibleHandler {
    OpenAiCompatibleHandler::with_dialect(DIALECT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, PlatformHandler};
    use serde_json::Value;

    #[test]
    fn test_deepseek_uses_max_tokens() {
        let handler = handler();
        let body = handler
            .build_request_body(&ChatRequest {
                model: "deepseek-chat",
                system_role: "",
                temperature: Some(0.9),
                max_tokens: Some(120),
                user_message: "Hi",
                custom_params: "",
            })
            .unwrap();
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["max_tokens"], 120);
        assert_eq!(body["temperature"], 0.9);
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn test_deepseek_endpoint() {
        let handler = handler();
        assert_eq!(handler.platform(), Platform::DeepSeek);
        assert_eq!(handler.endpoint("deepseek-chat", "k", ""), DEEPSEEK_ENDPOINT);
    }

    #[test]
    fn test_deepseek_parses_openai_shape() {
        let mut handler = handler();
        let body = r#"{"choices":[{"message":{"content":"ok"},"finish_reason":"length"}],"usage":{"total_tokens":11}}"#;
        assert_eq!(handler.parse_response_body(body).unwrap(), "ok");
        assert_eq!(handler.finish_reason(), Some("length"));
        assert_eq!(handler.total_tokens(), Some(11));
    }
}
