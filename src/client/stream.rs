//! Streaming chat.
//!
//! The stream runs on the caller's thread: `stream_chat` reads the response
//! line by line and invokes the callback synchronously for every chunk that
//! carries text or completes the stream. Session state sits behind a mutex
//! so a [`StreamHandle`] on another thread can observe it and request a
//! stop, which the read loop honours at its next poll.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{is_success, AiClient};
use crate::config::ClientOptions;
use crate::error::{AiError, Result};
use crate::llm::{ChatRequest, PlatformHandler};
use crate::transport::{LineRead, Transport};
use crate::types::{ChatConfig, StreamChunkInfo, StreamOutcome, StreamState};

/// Longest wait for the session lock when a stream starts or changes state.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
/// Longest wait for getters, setters and stop requests. On timeout they
/// fall back to a default value or do nothing.
const ACCESS_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest wait for per-line bookkeeping inside the read loop; a miss
/// skips that update.
const METRICS_TIMEOUT: Duration = Duration::from_millis(10);
/// Upper bound between checks for a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub(crate) struct StreamSession {
    state: StreamState,
    chunk_count: u32,
    total_bytes: u64,
    started: Option<Instant>,
    ended: Option<Instant>,
    /// Most recent raw line, or the error body of a rejected request.
    last_raw: String,
    status: Option<u16>,
    config: ChatConfig,
}

impl StreamSession {
    fn start(&mut self) {
        self.transition(StreamState::Starting);
        self.chunk_count = 0;
        self.total_bytes = 0;
        self.started = Some(Instant::now());
        self.ended = None;
        self.last_raw.clear();
        self.status = None;
    }

    fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => self.ended.unwrap_or_else(Instant::now) - started,
            None => Duration::ZERO,
        }
    }

    fn transition(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, "stream state");
        self.state = next;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SharedSession(Arc<Mutex<StreamSession>>);

impl SharedSession {
    /// Unbounded wait, only for the final state transition of a stream.
    fn lock(&self) -> MutexGuard<'_, StreamSession> {
        self.0.lock()
    }

    /// Bounded wait for a state transition that must not be skipped.
    fn try_lock(&self) -> Result<MutexGuard<'_, StreamSession>> {
        self.0
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or_else(|| AiError::Stream("Failed to acquire stream lock (timeout)".to_string()))
    }

    /// Run `f` under the lock, or return `None` if it stays held for
    /// longer than `timeout`.
    fn with<T>(&self, timeout: Duration, f: impl FnOnce(&mut StreamSession) -> T) -> Option<T> {
        match self.0.try_lock_for(timeout) {
            Some(mut session) => Some(f(&mut *session)),
            None => {
                debug!(timeout_ms = timeout.as_millis() as u64, "stream lock busy");
                None
            }
        }
    }

    /// Read through the lock, falling back to the default value when busy.
    fn read<T: Default>(&self, f: impl FnOnce(&StreamSession) -> T) -> T {
        self.with(ACCESS_TIMEOUT, |session| f(session)).unwrap_or_default()
    }

    /// Update through the lock. Returns false, with nothing changed, when busy.
    fn update(&self, f: impl FnOnce(&mut StreamSession)) -> bool {
        self.with(ACCESS_TIMEOUT, f).is_some()
    }
}

/// Cloneable, thread-safe view of a client's stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    session: SharedSession,
}

impl StreamHandle {
    /// Ask the running stream to stop. Returns false if nothing was
    /// starting or running, or if the session stayed busy.
    pub fn stop(&self) -> bool {
        self.session
            .with(ACCESS_TIMEOUT, |session| match session.state {
                StreamState::Starting | StreamState::Active => {
                    session.transition(StreamState::Stopping);
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }

    /// Current state; `Idle` if the session stayed busy.
    pub fn state(&self) -> StreamState {
        self.session.read(|session| session.state)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state(), StreamState::Starting | StreamState::Active)
    }
}

impl AiClient {
    /// Stream a chat response, calling `callback` for each chunk of text
    /// and once more on completion.
    ///
    /// Returning false from the callback cancels the stream; like a
    /// [`StreamHandle::stop`] request, that is reported as
    /// [`StreamOutcome::Cancelled`] rather than an error.
    pub fn stream_chat<F>(&mut self, user_message: &str, mut callback: F) -> Result<StreamOutcome>
    where
        F: FnMut(&StreamChunkInfo) -> bool,
    {
        self.last_error.clear();
        let result = self.run_stream(user_message, &mut callback);
        self.record(result)
    }

    fn run_stream(
        &mut self,
        user_message: &str,
        callback: &mut dyn FnMut(&StreamChunkInfo) -> bool,
    ) -> Result<StreamOutcome> {
        let config = {
            let mut session = self.stream.try_lock()?;
            if session.state != StreamState::Idle {
                return Err(AiError::Config(
                    "Streaming operation already in progress".to_string(),
                ));
            }
            if self.handler.is_none() {
                return Err(AiError::NotInitialized);
            }
            session.start();
            session.config.clone()
        };

        let result = self.open_and_read(user_message, &config, callback);

        let mut session = self.stream.lock();
        session.ended = Some(Instant::now());
        match &result {
            Ok(outcome) => {
                debug!(?outcome, chunks = session.chunk_count, "stream finished");
                session.transition(StreamState::Idle);
            }
            Err(err) => {
                warn!(error = %err, "stream failed");
                session.transition(StreamState::Error);
            }
        }
        result
    }

    fn open_and_read(
        &mut self,
        user_message: &str,
        config: &ChatConfig,
        callback: &mut dyn FnMut(&StreamChunkInfo) -> bool,
    ) -> Result<StreamOutcome> {
        let handler = self.handler.as_mut().ok_or(AiError::NotInitialized)?;
        handler.reset();

        let url = handler.stream_endpoint(&self.model, &self.api_key, &self.custom_endpoint);
        let body = handler.build_stream_request_body(&ChatRequest {
            model: &self.model,
            system_role: &config.system_role,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            user_message,
            custom_params: &config.custom_params,
        })?;
        trace_exchange!(url = %url, body = %body, "stream request");

        let transport = self.transport.as_mut();
        transport.end();
        let result = read_stream(
            transport,
            &mut **handler,
            &self.stream,
            &self.options,
            &self.api_key,
            &url,
            &body,
            callback,
        );
        transport.end();
        result
    }

    /// Request a stop of the running stream. See [`StreamHandle::stop`].
    pub fn stop_streaming(&self) -> bool {
        self.stream_handle().stop()
    }

    /// A handle that can stop or inspect this client's stream from another
    /// thread, including from inside the callback.
    pub fn stream_handle(&self) -> StreamHandle {
        StreamHandle {
            session: self.stream.clone(),
        }
    }

    /// Force the stream back to `Idle` and clear its configuration and
    /// metrics. Use this to recover after a failed stream.
    ///
    /// Does nothing if the session stays busy past a short wait.
    pub fn stream_chat_reset(&mut self) {
        if !self.stream.update(|session| *session = StreamSession::default()) {
            warn!("stream reset skipped, session busy");
        }
    }

    // Setters below are skipped if the session stays busy past a short wait.

    pub fn set_stream_chat_system_role(&mut self, system_role: &str) {
        self.stream
            .update(|session| session.config.system_role = system_role.to_string());
    }

    pub fn set_stream_chat_temperature(&mut self, temperature: f64) {
        self.stream.update(|session| session.config.set_temperature(temperature));
    }

    pub fn set_stream_chat_max_tokens(&mut self, max_tokens: u32) {
        self.stream.update(|session| session.config.set_max_tokens(max_tokens));
    }

    pub fn set_stream_chat_parameters(&mut self, json: &str) -> Result<()> {
        self.last_error.clear();
        let result = self
            .stream
            .with(ACCESS_TIMEOUT, |session| session.config.set_custom_params(json))
            .unwrap_or_else(|| {
                Err(AiError::Stream(
                    "Failed to acquire stream lock (timeout)".to_string(),
                ))
            });
        self.record(result)
    }

    // Getters below return a default value if the session stays busy.

    pub fn stream_chat_system_role(&self) -> String {
        self.stream.read(|session| session.config.system_role.clone())
    }

    pub fn stream_chat_temperature(&self) -> Option<f64> {
        self.stream.read(|session| session.config.temperature)
    }

    pub fn stream_chat_max_tokens(&self) -> Option<u32> {
        self.stream.read(|session| session.config.max_tokens)
    }

    pub fn stream_chat_parameters(&self) -> String {
        self.stream.read(|session| session.config.custom_params.clone())
    }

    /// Last raw line received, or the body of a rejected request.
    pub fn stream_chat_raw_response(&self) -> String {
        self.stream.read(|session| session.last_raw.clone())
    }

    pub fn stream_chat_response_code(&self) -> Option<u16> {
        self.stream.read(|session| session.status)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_handle().is_streaming()
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.read(|session| session.state)
    }

    pub fn stream_chunk_count(&self) -> u32 {
        self.stream.read(|session| session.chunk_count)
    }

    pub fn stream_total_bytes(&self) -> u64 {
        self.stream.read(|session| session.total_bytes)
    }

    /// Time since the last stream started, frozen once it ends.
    pub fn stream_elapsed(&self) -> Duration {
        self.stream.read(StreamSession::elapsed)
    }
}

#[allow(clippy::too_many_arguments)]
fn read_stream(
    transport: &mut dyn Transport,
    handler: &mut dyn PlatformHandler,
    session: &SharedSession,
    options: &ClientOptions,
    api_key: &str,
    url: &str,
    body: &str,
    callback: &mut dyn FnMut(&StreamChunkInfo) -> bool,
) -> Result<StreamOutcome> {
    transport.begin(url)?;
    handler.set_headers(transport, api_key);
    transport.set_timeout(options.http_timeout);
    let status = transport.post(body)?;
    session.with(METRICS_TIMEOUT, |s| s.status = Some(status));

    if !is_success(status) {
        let body = transport.body_string().unwrap_or_default();
        session.with(METRICS_TIMEOUT, |s| s.last_raw.clone_from(&body));
        return Err(AiError::Http { status, body });
    }

    let started = {
        let mut session = session.try_lock()?;
        if session.state == StreamState::Stopping {
            return Ok(StreamOutcome::Cancelled);
        }
        session.transition(StreamState::Active);
        session.started.unwrap_or_else(Instant::now)
    };

    let chunk_timeout = options.stream_chunk_timeout;
    let poll = chunk_timeout.min(POLL_INTERVAL);
    let mut last_line = Instant::now();
    let mut chunk_index: u32 = 0;
    let mut total_bytes: u64 = 0;

    loop {
        // A busy lock counts as no stop request; the next poll sees it.
        let stopping = session
            .with(METRICS_TIMEOUT, |s| s.state == StreamState::Stopping)
            .unwrap_or(false);
        if stopping {
            debug!("stop requested");
            return Ok(StreamOutcome::Cancelled);
        }

        let line = match transport.read_line(poll)? {
            LineRead::Line(line) => line,
            LineRead::Idle => {
                if last_line.elapsed() >= chunk_timeout {
                    return Err(AiError::StreamTimeout(chunk_timeout.as_millis() as u64));
                }
                continue;
            }
            LineRead::Eof => {
                return Err(AiError::Stream("Stream ended before completion".to_string()));
            }
        };
        last_line = Instant::now();

        chunk_index += 1;
        total_bytes += line.len() as u64;
        // Metrics catch up on the next line if this update is skipped.
        session.with(METRICS_TIMEOUT, |s| {
            s.chunk_count = chunk_index;
            s.total_bytes = total_bytes;
            s.last_raw.clone_from(&line);
        });

        let chunk = handler.process_stream_chunk(&line)?;
        if chunk.content.is_empty() && !chunk.is_complete {
            continue;
        }

        let info = StreamChunkInfo {
            content: chunk.content,
            is_complete: chunk.is_complete,
            chunk_index,
            total_bytes,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: String::new(),
        };
        if !callback(&info) {
            debug!(chunk_index, "callback cancelled the stream");
            return Ok(StreamOutcome::Cancelled);
        }
        if info.is_complete {
            return Ok(StreamOutcome::Completed);
        }
    }
}
