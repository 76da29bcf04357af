//! Streaming chat completions over the OpenAI-compatible event protocol.

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CoordError, Result};
use crate::provider_lmstudio::LmStudioClient;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// `low` / `medium` / `high`; sent as `reasoning: {effort}`.
    pub reasoning_effort: Option<String>,
    /// Ask for per-token log probabilities with this many alternatives.
    pub top_logprobs: Option<u8>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn body(&self, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages,
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = self.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if let Some(effort) = self.reasoning_effort.as_deref().filter(|e| !e.is_empty()) {
            body["reasoning"] = json!({ "effort": effort });
        }
        if let Some(n) = self.top_logprobs {
            body["logprobs"] = json!(true);
            body["top_logprobs"] = json!(n);
        }
        body
    }
}

/// What one stream chunk contributed. Either text may be empty.
#[derive(Clone, Copy, Debug)]
pub struct StreamDelta<'a> {
    pub content: &'a str,
    pub reasoning: &'a str,
    /// The raw `choices[0]` object (`Null` when the chunk had none).
    pub choice: &'a Value,
}

/// Receiver of stream deltas. Higher-ranked over the chunk lifetime so it
/// can be forwarded through `async_trait` methods.
pub type DeltaSink<'s> = dyn for<'d> FnMut(StreamDelta<'d>) + Send + 's;

/// Splits a byte stream into complete lines. A trailing partial line stays
/// buffered until its newline arrives, so multi-byte characters split
/// across reads are decoded whole.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// One decoded event line.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Chunk(Value),
    Done,
}

/// `Ok(None)` for lines that carry no event (blank, comments, other
/// fields). Unparseable payloads are `MalformedFrame`.
pub fn parse_frame(line: &str) -> Result<Option<Frame>> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Ok(Some(Frame::Done));
    }
    serde_json::from_str(payload)
        .map(|v| Some(Frame::Chunk(v)))
        .map_err(|e| CoordError::MalformedFrame(format!("{e}: {payload}")))
}

fn emit(chunk: &Value, on_delta: &mut DeltaSink<'_>) {
    let choice = &chunk["choices"][0];
    let delta = &choice["delta"];
    let reasoning = delta["reasoning"]
        .as_str()
        .or_else(|| delta["reasoning_content"].as_str())
        .unwrap_or("");
    on_delta(StreamDelta {
        content: delta["content"].as_str().unwrap_or(""),
        reasoning,
        choice,
    });
}

fn handle_line(line: &str, on_delta: &mut DeltaSink<'_>) {
    match parse_frame(line) {
        Ok(Some(Frame::Chunk(chunk))) => emit(&chunk, on_delta),
        Ok(Some(Frame::Done)) | Ok(None) => {}
        Err(e) => trace!("stream: skipping {e}"),
    }
}

/// Streaming completion engine bound to one server.
#[derive(Clone, Debug)]
pub struct StreamingEngine {
    client: LmStudioClient,
}

impl StreamingEngine {
    pub fn new(client: LmStudioClient) -> Self {
        Self { client }
    }

    /// Stream one completion, reporting every chunk to `on_delta`.
    ///
    /// Cancelling `cancel` drops the request and yields
    /// `CoordError::Cancelled`.
    pub async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<()> {
        let body = request.body(true);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoordError::Cancelled),
            r = self.client.chat_completions(&body) => r?,
        };
        debug!(model=%request.model, "stream: opened");

        let mut bytes = response.bytes_stream();
        let mut decoder = LineDecoder::new();
        loop {
            let next: Option<reqwest::Result<Bytes>> = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoordError::Cancelled),
                n = bytes.next() => n,
            };
            match next {
                Some(Ok(chunk)) => {
                    for line in decoder.push(&chunk) {
                        handle_line(&line, on_delta);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        if let Some(line) = decoder.finish() {
            handle_line(&line, on_delta);
        }
        debug!(model=%request.model, "stream: finished");
        Ok(())
    }

    /// Same request with streaming off; the full reply in one response.
    pub async fn complete_once(&self, request: &ChatRequest) -> Result<String> {
        let resp = self.client.chat_completions(&request.body(false)).await?;
        let data: Value = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string())
    }
}
