//! Error types for ai-connect.
//!
//! Every failing operation on [`crate::AiClient`] returns one of these and
//! also leaves its `Display` text in the client's last-error slot.

use thiserror::Error;

/// Errors produced by the client, its handlers and transports.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AiError {
    /// The platform identifier is unknown or its handler was compiled out.
    #[error("Platform '{0}' is not supported or was disabled at build time")]
    UnsupportedPlatform(String),

    /// An operation was invoked before a successful `begin`.
    #[error("Platform handler not initialized. Call begin() with a supported platform.")]
    NotInitialized,

    /// A prerequisite setup step is missing (tools not registered, no
    /// pending tool calls, stream already running).
    #[error("{0}")]
    Config(String),

    /// Caller-supplied data failed validation before any I/O.
    #[error("{0}")]
    Validation(String),

    /// The connection could not be established or the request not sent.
    #[error("HTTP Request Failed: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("HTTP Error: {status} - Response: {body}")]
    Http { status: u16, body: String },

    /// The provider embedded an error envelope in its response.
    #[error("API Error: {0}")]
    Api(String),

    /// The response was malformed or lacked the expected content path.
    #[error("{0}")]
    Parse(String),

    /// No stream data arrived within the per-chunk inactivity window.
    #[error("Stream timeout: No data received within {0}ms")]
    StreamTimeout(u64),

    /// The stream failed mid-flight.
    #[error("{0}")]
    Stream(String),
}

impl AiError {
    /// Build a [`AiError::Parse`] from a JSON decoding failure.
    pub(crate) fn json(context: &str, err: serde_json::Error) -> Self {
        AiError::Parse(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, AiError>;
