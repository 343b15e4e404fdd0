//! Plain chat: one request, one response.

use super::{check_status, post_json, AiClient};
use crate::error::{AiError, Result};
use crate::llm::ChatRequest;

impl AiClient {
    pub fn set_chat_system_role(&mut self, system_role: &str) {
        self.chat_config.system_role = system_role.to_string();
    }

    /// Clamped to `[0, 2]`.
    pub fn set_chat_temperature(&mut self, temperature: f64) {
        self.chat_config.set_temperature(temperature);
    }

    pub fn set_chat_max_tokens(&mut self, max_tokens: u32) {
        self.chat_config.set_max_tokens(max_tokens);
    }

    /// Extra request fields as a JSON object. Rejected if malformed, in
    /// which case the previous parameters are kept.
    pub fn set_chat_parameters(&mut self, json: &str) -> Result<()> {
        self.last_error.clear();
        let result = self.chat_config.set_custom_params(json);
        self.record(result)
    }

    pub fn chat_system_role(&self) -> &str {
        &self.chat_config.system_role
    }

    pub fn chat_temperature(&self) -> Option<f64> {
        self.chat_config.temperature
    }

    pub fn chat_max_tokens(&self) -> Option<u32> {
        self.chat_config.max_tokens
    }

    pub fn chat_parameters(&self) -> &str {
        &self.chat_config.custom_params
    }

    pub fn chat_raw_response(&self) -> &str {
        &self.chat_exchange.body
    }

    pub fn chat_response_code(&self) -> Option<u16> {
        self.chat_exchange.status
    }

    /// Send `user_message` and return the assistant's text.
    pub fn chat(&mut self, user_message: &str) -> Result<String> {
        self.last_error.clear();
        let result = self.run_chat(user_message);
        self.record(result)
    }

    fn run_chat(&mut self, user_message: &str) -> Result<String> {
        self.chat_exchange.clear();
        let handler = self.handler.as_mut().ok_or(AiError::NotInitialized)?;

        let url = handler.endpoint(&self.model, &self.api_key, &self.custom_endpoint);
        let body = handler.build_request_body(&ChatRequest {
            model: &self.model,
            system_role: &self.chat_config.system_role,
            temperature: self.chat_config.temperature,
            max_tokens: self.chat_config.max_tokens,
            user_message,
            custom_params: &self.chat_config.custom_params,
        })?;
        trace_exchange!(url = %url, body = %body, "chat request");

        let (status, response) = post_json(
            self.transport.as_mut(),
            &**handler,
            &self.api_key,
            self.options.http_timeout,
            &url,
            &body,
        )?;
        self.chat_exchange.status = Some(status);
        self.chat_exchange.body = response;
        check_status(status, &self.chat_exchange.body)?;

        handler.parse_response_body(&self.chat_exchange.body)
    }

    /// Clear chat configuration and the last raw exchange. Handler counters
    /// are untouched.
    pub fn chat_reset(&mut self) {
        self.chat_config.reset();
        self.chat_exchange.clear();
    }
}
