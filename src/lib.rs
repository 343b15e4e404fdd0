//! ai-connect: one client for several LLM chat APIs.
//!
//! A [`PlatformHandler`](llm::PlatformHandler) translates between the
//! normalized request/response model and one provider's wire format. The
//! [`AiClient`] owns exactly one handler and drives plain chat, the
//! two-phase tool-calling cycle and callback-based streaming over a
//! blocking [`Transport`](transport::Transport).

/// Dump request and response bodies when built with `debug-trace`.
macro_rules! trace_exchange {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug-trace")]
        {
            tracing::debug!($($arg)*);
        }
    };
}

pub mod client;
pub mod config;
pub mod error;
pub mod llm;
pub mod transport;
pub mod types;

#[cfg(feature = "stream-chat")]
pub use client::StreamHandle;
pub use client::AiClient;
pub use config::ClientOptions;
pub use error::{AiError, Result};
pub use llm::Platform;
pub use types::{ChatConfig, StreamChunkInfo, StreamOutcome, StreamState, ToolCall, ToolResult};
