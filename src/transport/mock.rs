//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{LineRead, TlsMode, Transport};
use crate::error::{AiError, Result};

/// One scripted line of a streamed response.
#[derive(Debug, Clone)]
pub enum MockLine {
    Line(String),
    /// Never deliver anything again; every read waits and returns `Idle`.
    Hang,
}

/// One scripted answer to a `post`.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    /// `None` simulates a connection failure.
    pub status: Option<u16>,
    pub body: String,
    pub lines: VecDeque<MockLine>,
}

impl MockResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status: Some(status),
            body: body.to_string(),
            lines: VecDeque::new(),
        }
    }

    pub fn stream(lines: &[&str]) -> Self {
        Self {
            status: Some(200),
            body: String::new(),
            lines: lines.iter().map(|l| MockLine::Line(l.to_string())).collect(),
        }
    }

    pub fn connection_refused() -> Self {
        Self::default()
    }

    pub fn then_hang(mut self) -> Self {
        self.lines.push_back(MockLine::Hang);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout: Duration,
    pub tls: TlsMode,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub responses: VecDeque<MockResponse>,
    pub requests: Vec<RecordedRequest>,
    pub ends: usize,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    tls: TlsMode,
    active: Option<MockResponse>,
}

/// Cloneable handle: the test keeps one clone to inspect what the client
/// sent after moving the other into it.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        let transport = Self::default();
        transport.state.lock().responses = responses.into();
        transport
    }

    pub fn push(&self, response: MockResponse) {
        self.state.lock().responses.push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.state.lock().requests.last().cloned().unwrap()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn ends(&self) -> usize {
        self.state.lock().ends
    }
}

impl Transport for MockTransport {
    fn set_tls(&mut self, mode: TlsMode) {
        self.state.lock().tls = mode;
    }

    fn begin(&mut self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.url = url.to_string();
        state.headers.clear();
        state.active = None;
        Ok(())
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.state
            .lock()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.state.lock().timeout = timeout;
    }

    fn post(&mut self, body: &str) -> Result<u16> {
        let mut state = self.state.lock();
        let request = RecordedRequest {
            url: state.url.clone(),
            headers: state.headers.clone(),
            body: body.to_string(),
            timeout: state.timeout,
            tls: state.tls.clone(),
        };
        state.requests.push(request);

        let response = state
            .responses
            .pop_front()
            .ok_or_else(|| AiError::Transport("no scripted response".to_string()))?;
        let status = response
            .status
            .ok_or_else(|| AiError::Transport("connection refused".to_string()))?;
        state.active = Some(response);
        Ok(status)
    }

    fn body_string(&mut self) -> Result<String> {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .map(|r| r.body.clone())
            .ok_or_else(|| AiError::Transport("No response to read".to_string()))
    }

    fn read_line(&mut self, wait: Duration) -> Result<LineRead> {
        let next = {
            let mut state = self.state.lock();
            let Some(active) = state.active.as_mut() else {
                return Ok(LineRead::Eof);
            };
            match active.lines.front() {
                Some(MockLine::Hang) => None,
                Some(MockLine::Line(_)) => match active.lines.pop_front() {
                    Some(MockLine::Line(line)) => Some(LineRead::Line(line)),
                    _ => Some(LineRead::Eof),
                },
                None => Some(LineRead::Eof),
            }
        };
        match next {
            Some(read) => Ok(read),
            None => {
                std::thread::sleep(wait);
                Ok(LineRead::Idle)
            }
        }
    }

    fn end(&mut self) {
        let mut state = self.state.lock();
        state.active = None;
        state.ends += 1;
    }
}
