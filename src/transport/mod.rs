//! HTTP transport used by the client.
//!
//! The client talks to the network only through [`Transport`], a blocking,
//! connection-oriented interface: open a URL, set headers, post one body,
//! then either read the whole response or read it line by line. One
//! transport is shared by every exchange a client makes, so at most one
//! request is in flight at a time.

pub mod http;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use crate::error::Result;

pub use http::HttpTransport;

/// TLS verification policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Accept any server certificate.
    #[default]
    Insecure,
    /// Verify against this PEM-encoded root certificate only.
    Trusted(String),
}

/// Result of waiting for the next line of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, without its terminator.
    Line(String),
    /// Nothing arrived within the wait.
    Idle,
    /// The server closed the response.
    Eof,
}

pub trait Transport: Send {
    fn set_tls(&mut self, mode: TlsMode);

    /// Prepare a request to `url`. Headers from a previous request are dropped.
    fn begin(&mut self, url: &str) -> Result<()>;

    fn set_header(&mut self, name: &str, value: &str);

    /// Bound on connecting and receiving response headers.
    fn set_timeout(&mut self, timeout: Duration);

    /// Send `body` and return the HTTP status. `Err` means no status was
    /// received at all.
    fn post(&mut self, body: &str) -> Result<u16>;

    /// Read the full response body.
    fn body_string(&mut self) -> Result<String>;

    /// Wait up to `wait` for the next response line.
    fn read_line(&mut self, wait: Duration) -> Result<LineRead>;

    /// Release the connection. Safe to call repeatedly.
    fn end(&mut self);
}
