//! [`Transport`] over reqwest.
//!
//! reqwest is async, the client API is not: each call drives a private
//! current-thread tokio runtime with `block_on`. Do not use this transport
//! from inside another tokio runtime.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::debug;

use super::{LineRead, TlsMode, Transport};
use crate::config::ClientOptions;
use crate::error::{AiError, Result};

type ByteStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

pub struct HttpTransport {
    runtime: Option<tokio::runtime::Runtime>,
    client: Option<reqwest::Client>,
    tls: TlsMode,
    timeout: Duration,
    url: String,
    headers: Vec<(String, String)>,
    response: Option<reqwest::Response>,
    stream: Option<ByteStream>,
    line_buffer: Vec<u8>,
    eof: bool,
    response_capacity: usize,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_options(&ClientOptions::default())
    }

    pub fn with_options(options: &ClientOptions) -> Self {
        Self {
            runtime: None,
            client: None,
            tls: TlsMode::default(),
            timeout: options.http_timeout,
            url: String::new(),
            headers: Vec::new(),
            response: None,
            stream: None,
            line_buffer: Vec::with_capacity(options.stream_read_chunk),
            eof: false,
            response_capacity: options.response_buffer_size,
        }
    }

    fn runtime(&mut self) -> Result<&tokio::runtime::Runtime> {
        if self.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| AiError::Transport(format!("Failed to start runtime: {}", e)))?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| AiError::Transport("Runtime unavailable".to_string()))
    }

    fn client(&mut self) -> Result<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let builder = reqwest::Client::builder().connect_timeout(self.timeout);
        let builder = match &self.tls {
            TlsMode::Insecure => builder.danger_accept_invalid_certs(true),
            TlsMode::Trusted(pem) => {
                let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                    .map_err(|e| AiError::Transport(format!("Invalid root CA: {}", e)))?;
                builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(certificate)
            }
        };
        let client = builder
            .build()
            .map_err(|e| AiError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Split the next complete line off the buffer.
    fn take_line(&mut self) -> Option<String> {
        let newline = self.line_buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.line_buffer.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn set_tls(&mut self, mode: TlsMode) {
        if self.tls != mode {
            self.tls = mode;
            self.client = None;
        }
    }

    fn begin(&mut self, url: &str) -> Result<()> {
        reqwest::Url::parse(url)
            .map_err(|e| AiError::Transport(format!("Invalid URL '{}': {}", url, e)))?;
        self.end();
        self.url = url.to_string();
        Ok(())
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn set_timeout(&mut self, timeout: Duration) {
        if self.timeout != timeout {
            self.timeout = timeout;
            self.client = None;
        }
    }

    fn post(&mut self, body: &str) -> Result<u16> {
        let client = self.client()?;
        let mut request = client.post(&self.url).body(body.to_string());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let timeout = self.timeout;
        let response = self
            .runtime()?
            .block_on(async { tokio::time::timeout(timeout, request.send()).await })
            .map_err(|_| AiError::Transport(format!("timed out after {}ms", timeout.as_millis())))?
            .map_err(|e| AiError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        debug!(status, url = %self.url, "response headers received");
        self.response = Some(response);
        Ok(status)
    }

    fn body_string(&mut self) -> Result<String> {
        let response = self
            .response
            .take()
            .ok_or_else(|| AiError::Transport("No response to read".to_string()))?;
        let capacity = self.response_capacity;
        let timeout = self.timeout;
        let bytes = self
            .runtime()?
            .block_on(async {
                tokio::time::timeout(timeout, async {
                    let mut body = Vec::with_capacity(capacity);
                    let mut chunks = response.bytes_stream();
                    while let Some(chunk) = chunks.next().await {
                        body.extend_from_slice(&chunk?);
                    }
                    Ok::<_, reqwest::Error>(body)
                })
                .await
            })
            .map_err(|_| AiError::Transport("timed out reading response body".to_string()))?
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_line(&mut self, wait: Duration) -> Result<LineRead> {
        if self.stream.is_none() {
            if let Some(response) = self.response.take() {
                self.stream = Some(response.bytes_stream().map(|c| c.map(|b| b.to_vec())).boxed());
            }
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(line) = self.take_line() {
                return Ok(LineRead::Line(line));
            }
            if self.eof {
                if self.line_buffer.is_empty() {
                    return Ok(LineRead::Eof);
                }
                let rest = std::mem::take(&mut self.line_buffer);
                return Ok(LineRead::Line(String::from_utf8_lossy(&rest).into_owned()));
            }

            let Some(mut stream) = self.stream.take() else {
                return Ok(LineRead::Eof);
            };
            let next = self
                .runtime()?
                .block_on(async { tokio::time::timeout_at(deadline, stream.next()).await });
            self.stream = Some(stream);

            match next {
                Err(_) => return Ok(LineRead::Idle),
                Ok(None) => self.eof = true,
                Ok(Some(Ok(bytes))) => self.line_buffer.extend_from_slice(&bytes),
                Ok(Some(Err(e))) => return Err(AiError::Transport(e.to_string())),
            }
        }
    }

    fn end(&mut self) {
        self.response = None;
        self.stream = None;
        self.line_buffer.clear();
        self.eof = false;
        self.headers.clear();
    }
}
