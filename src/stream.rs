//! Incremental reader for streamed chat completions.
//!
//! The chat endpoint answers with server-sent events:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Network reads arrive in arbitrary chunks, so a chunk may end in the middle
//! of a line, of a JSON object, or of a multi-byte character. [`StreamCursor`]
//! hides all of that: feed it raw bytes and it hands back the text deltas that
//! became complete.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::chat::conversation_state::ConversationState;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";
const CONTENT_POINTER: &str = "/choices/0/delta/content";

/// Decodes UTF-8 across chunk boundaries.
///
/// An incomplete multi-byte sequence at the end of a chunk is carried over to
/// the next one. Invalid sequences become U+FFFD instead of failing the read.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut decoded = String::new();
        let mut input = self.pending.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    input = &input[input.len()..];
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    decoded.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        // Truncated sequence: wait for the rest of it.
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }

        let remainder = input.to_vec();
        self.pending = remainder;
        decoded
    }

    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

enum Line<'a> {
    Ignored,
    Done,
    Payload(&'a str),
}

fn classify(line: &str) -> Line<'_> {
    if line.starts_with(':') || line.trim().is_empty() {
        return Line::Ignored;
    }
    match line.strip_prefix(DATA_PREFIX) {
        Some(rest) => {
            let payload = rest.trim();
            if payload == DONE_SENTINEL {
                Line::Done
            } else {
                Line::Payload(payload)
            }
        }
        None => Line::Ignored,
    }
}

/// Parsing state for one streamed reply.
///
/// Created per request and dropped when the request ends. All state lives
/// here, so [`StreamCursor::feed`] is a plain step function over
/// `(cursor, bytes) -> deltas`.
#[derive(Debug, Default)]
pub struct StreamCursor {
    decoder: Utf8Decoder,
    buffer: String,
    done: bool,
    // The front of `buffer` is a line that failed to parse and is waiting
    // for more bytes before its single retry.
    held_line: bool,
}

impl StreamCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume one network chunk and return the deltas it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        let text = self.decoder.decode(chunk);
        if text.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(&text);
        self.drain_lines(false)
    }

    /// Flush at end of stream.
    ///
    /// A line still held for retry gets its last attempt and is dropped if it
    /// fails again. An unterminated trailing line is discarded.
    pub fn finish(&mut self) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let deltas = self.drain_lines(true);

        if !self.done && !self.buffer.trim().is_empty() {
            debug!("Discarding unterminated line at end of stream: {:?}", self.buffer);
        }
        self.buffer.clear();
        deltas
    }

    fn drain_lines(&mut self, final_pass: bool) -> Vec<String> {
        let mut deltas = Vec::new();
        let mut retrying = std::mem::take(&mut self.held_line);

        while !self.done {
            let Some(newline) = self.buffer.find('\n') else {
                break;
            };
            let mut line: String = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            let is_retry = std::mem::replace(&mut retrying, false);
            let payload = match classify(&line) {
                Line::Ignored => continue,
                Line::Done => {
                    debug!("Received stream sentinel");
                    self.done = true;
                    break;
                }
                Line::Payload(payload) => payload,
            };

            match serde_json::from_str::<Value>(payload) {
                Ok(event) => {
                    let delta = event.pointer(CONTENT_POINTER).and_then(Value::as_str);
                    if let Some(delta) = delta.filter(|d| !d.is_empty()) {
                        deltas.push(delta.to_string());
                    }
                }
                Err(err) if is_retry || final_pass => {
                    warn!("Dropping unparseable stream payload ({}): {}", err, payload);
                }
                Err(_) => {
                    // Possibly an object split across reads; retry once more
                    // bytes have arrived.
                    self.buffer.insert_str(0, &format!("{}\n", line));
                    self.held_line = true;
                    break;
                }
            }
        }

        deltas
    }
}

/// One step of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A non-empty fragment of assistant text.
    Delta(String),
    /// The `[DONE]` sentinel arrived; nothing follows.
    Done,
}

/// How a streamed reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The `[DONE]` sentinel arrived.
    Completed,
    /// The body ended without a sentinel.
    Ended,
    /// The cancellation token fired before the reply finished.
    Cancelled,
}

/// Lazily turn a response body into reply events.
///
/// The stream ends after [`StreamEvent::Done`], at end of body, or right after
/// yielding the first transport error.
pub fn event_stream<S, E>(body: S) -> impl Stream<Item = Result<StreamEvent, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    struct State<S> {
        body: S,
        cursor: StreamCursor,
        ready: VecDeque<String>,
        finished: bool,
    }

    let state = State {
        body,
        cursor: StreamCursor::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.ready.pop_front() {
                return Some((Ok(StreamEvent::Delta(delta)), state));
            }
            if state.finished {
                return None;
            }
            if state.cursor.is_done() {
                state.finished = true;
                return Some((Ok(StreamEvent::Done), state));
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let deltas = state.cursor.feed(&chunk);
                    state.ready.extend(deltas);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    let deltas = state.cursor.finish();
                    state.ready.extend(deltas);
                    state.finished = !state.cursor.is_done();
                }
            }
        }
    })
}

/// Read a streamed reply into `conversation`.
///
/// Every delta replaces the trailing assistant message with the text
/// accumulated so far (appending it on first content). `on_delta` sees each
/// fragment as it arrives. On error or cancellation the text already applied
/// is left in place and the body is dropped.
pub async fn read_into_conversation<S, E, F>(
    body: S,
    conversation: &mut ConversationState,
    cancel: &CancellationToken,
    mut on_delta: F,
) -> Result<StreamOutcome, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    F: FnMut(&str),
{
    let events = event_stream(body);
    futures::pin_mut!(events);
    let mut reply = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled after {} bytes of content", reply.len());
                return Ok(StreamOutcome::Cancelled);
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(StreamEvent::Delta(delta))) => {
                on_delta(&delta);
                reply.push_str(&delta);
                conversation.upsert_assistant_message(&reply);
            }
            Some(Ok(StreamEvent::Done)) => return Ok(StreamOutcome::Completed),
            Some(Err(err)) => return Err(err),
            None => return Ok(StreamOutcome::Ended),
        }
    }
}
