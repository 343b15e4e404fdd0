//! The client: one platform handler, one transport, three controllers.
//!
//! - `chat`: single request/response exchanges
//! - `tools`: the two-phase tool-calling cycle
//! - `stream`: callback-driven streaming with cooperative cancellation
//!
//! Every public operation clears [`AiClient::last_error`] on entry and
//! stores the error text there if it fails, in addition to returning it.

mod chat;
#[cfg(feature = "stream-chat")]
mod stream;
#[cfg(feature = "tool-calls")]
mod tools;

use std::time::Duration;

use tracing::debug;

use crate::config::ClientOptions;
use crate::error::{AiError, Result};
use crate::llm::{self, Platform, PlatformHandler};
use crate::transport::{HttpTransport, TlsMode, Transport};
use crate::types::ChatConfig;

#[cfg(feature = "stream-chat")]
pub use stream::StreamHandle;

#[cfg(feature = "stream-chat")]
use stream::SharedSession;
#[cfg(feature = "tool-calls")]
use tools::ToolCallState;

/// Last raw body and status of one kind of exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RawExchange {
    pub status: Option<u16>,
    pub body: String,
}

impl RawExchange {
    fn clear(&mut self) {
        self.status = None;
        self.body.clear();
    }
}

pub struct AiClient {
    transport: Box<dyn Transport>,
    options: ClientOptions,
    handler: Option<Box<dyn PlatformHandler>>,
    api_key: String,
    model: String,
    custom_endpoint: String,
    root_ca: Option<String>,
    last_error: String,
    chat_config: ChatConfig,
    chat_exchange: RawExchange,
    #[cfg(feature = "tool-calls")]
    tc: ToolCallState,
    #[cfg(feature = "stream-chat")]
    stream: SharedSession,
}

impl AiClient {
    /// Connect to `platform` over HTTPS with default options.
    pub fn new(platform: &str, api_key: &str, model: &str) -> Result<Self> {
        Self::with_endpoint(platform, api_key, model, "")
    }

    /// Like [`AiClient::new`], sending every request to `endpoint` instead of
    /// the provider's default URL.
    pub fn with_endpoint(platform: &str, api_key: &str, model: &str, endpoint: &str) -> Result<Self> {
        let options = ClientOptions::default();
        let mut client = Self::with_transport(HttpTransport::with_options(&options), options);
        client.begin_with_endpoint(platform, api_key, model, endpoint)?;
        Ok(client)
    }

    /// An unconfigured client; call [`AiClient::begin`] before use.
    pub fn with_transport(transport: impl Transport + 'static, options: ClientOptions) -> Self {
        Self {
            transport: Box::new(transport),
            options,
            handler: None,
            api_key: String::new(),
            model: String::new(),
            custom_endpoint: String::new(),
            root_ca: None,
            last_error: String::new(),
            chat_config: ChatConfig::default(),
            chat_exchange: RawExchange::default(),
            #[cfg(feature = "tool-calls")]
            tc: ToolCallState::default(),
            #[cfg(feature = "stream-chat")]
            stream: SharedSession::default(),
        }
    }

    /// (Re)select the platform. Configuration set through the `set_*`
    /// methods is kept; only the handler is replaced.
    pub fn begin(&mut self, platform: &str, api_key: &str, model: &str) -> Result<()> {
        self.begin_with_endpoint(platform, api_key, model, "")
    }

    pub fn begin_with_endpoint(
        &mut self,
        platform: &str,
        api_key: &str,
        model: &str,
        endpoint: &str,
    ) -> Result<()> {
        self.last_error.clear();
        self.handler = None;
        self.api_key = api_key.to_string();
        self.model = model.to_string();
        self.custom_endpoint = endpoint.to_string();

        let result = llm::create_handler(platform).map(|handler| {
            debug!(platform = %handler.platform(), model, "platform handler ready");
            self.handler = Some(handler);
        });
        self.record(result)
    }

    pub fn platform(&self) -> Option<Platform> {
        self.handler.as_ref().map(|h| h.platform())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Text of the most recent failure, empty if the last operation succeeded.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Finish reason of the last parsed response, in the provider's vocabulary.
    pub fn finish_reason(&self) -> Option<&str> {
        self.handler.as_ref().and_then(|h| h.finish_reason())
    }

    pub fn total_tokens(&self) -> Option<u64> {
        self.handler.as_ref().and_then(|h| h.total_tokens())
    }

    /// Verify servers against `pem`, or accept any certificate with `None`.
    pub fn set_root_ca(&mut self, pem: Option<&str>) {
        self.root_ca = pem.map(str::to_string);
        let mode = match &self.root_ca {
            Some(pem) => TlsMode::Trusted(pem.clone()),
            None => TlsMode::Insecure,
        };
        self.transport.set_tls(mode);
    }

    pub fn root_ca(&self) -> Option<&str> {
        self.root_ca.as_deref()
    }

    /// Mirror a failure into `last_error`.
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!(error = %err, "operation failed");
            self.last_error = err.to_string();
        }
        result
    }
}

/// POST `body` to `url` and read the whole response.
///
/// The connection is closed before and after the exchange on every path.
pub(crate) fn post_json(
    transport: &mut dyn Transport,
    handler: &dyn PlatformHandler,
    api_key: &str,
    timeout: Duration,
    url: &str,
    body: &str,
) -> Result<(u16, String)> {
    transport.end();
    let result = send(transport, handler, api_key, timeout, url, body);
    transport.end();
    result
}

fn send(
    transport: &mut dyn Transport,
    handler: &dyn PlatformHandler,
    api_key: &str,
    timeout: Duration,
    url: &str,
    body: &str,
) -> Result<(u16, String)> {
    transport.begin(url)?;
    handler.set_headers(transport, api_key);
    transport.set_timeout(timeout);
    let status = transport.post(body)?;
    let response = transport.body_string()?;
    trace_exchange!(status, body = %response, "response received");
    Ok((status, response))
}

pub(crate) fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Fail with [`AiError::Http`] for non-2xx statuses.
pub(crate) fn check_status(status: u16, body: &str) -> Result<()> {
    if is_success(status) {
        Ok(())
    } else {
        Err(AiError::Http {
            status,
            body: body.to_string(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn test_unsupported_platform_leaves_client_unconfigured() {
        let (mut client, _) = mock_client("openai", vec![]);
        assert_eq!(client.platform(), Some(Platform::OpenAi));

        let err = client.begin("llama", "k", "m").unwrap_err();
        assert!(matches!(err, AiError::UnsupportedPlatform(_)));
        assert_eq!(client.platform(), None);
        assert!(client.last_error().contains("llama"));

        let err = client.chat("hi").unwrap_err();
        assert_eq!(err, AiError::NotInitialized);
    }

    #[test]
    fn test_unconfigured_client() {
        let mut client = AiClient::with_transport(MockTransport::default(), ClientOptions::default());
        assert_eq!(client.platform(), None);
        assert_eq!(client.finish_reason(), None);
        assert!(client.chat("hi").is_err());
        assert!(client.last_error().contains("not initialized"));
    }

    #[test]
    fn test_root_ca_toggles_tls_mode() {
        let (mut client, transport) = mock_client(
            "openai",
            vec![crate::transport::mock::MockResponse::json(
                200,
                r#"{"choices":[{"message":{"content":"ok"},"finish_reason":"stop"}]}"#,
            )],
        );
        assert_eq!(client.root_ca(), None);
        client.set_root_ca(Some("-----BEGIN CERTIFICATE-----"));
        assert_eq!(client.root_ca(), Some("-----BEGIN CERTIFICATE-----"));
        client.chat("hi").unwrap();
        assert_eq!(
            transport.last_request().tls,
            TlsMode::Trusted("-----BEGIN CERTIFICATE-----".to_string())
        );
        client.set_root_ca(None);
        assert_eq!(client.root_ca(), None);
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(200, "").is_ok());
        assert!(check_status(204, "").is_ok());
        assert_eq!(
            check_status(429, "slow down").unwrap_err().to_string(),
            "HTTP Error: 429 - Response: slow down"
        );
    }
}
