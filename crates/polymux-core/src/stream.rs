//! Streaming pump: frame the upstream byte stream, decode chunks into IR
//! deltas, re-encode for the client, and account usage along the way.

use bytes::Bytes;

use polymux_protocol::sse::SseParser;
use polymux_protocol::{ChatResponse, Dialect, StopReason, StreamDelta, StreamEncoder, Usage};

use crate::error::{classify_status, Error};

/// Wire-framing detector. Upstreams answer SSE, NDJSON, or a JSON array
/// depending on provider and endpoint; the first bytes decide the mode.
#[derive(Debug)]
enum DecoderMode {
    Unknown,
    Sse(SseParser),
    Ndjson(String),
    JsonArray(JsonArrayDecoder),
}

#[derive(Debug)]
pub struct StreamDecoder {
    mode: DecoderMode,
    pending: String,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            mode: DecoderMode::Unknown,
            pending: String::new(),
        }
    }

    /// Feed raw bytes; returns the payload strings completed so far.
    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };

        match &mut self.mode {
            DecoderMode::Unknown => {
                self.pending.push_str(text);
                let combined = self.pending.as_str();
                let first_non_ws = combined.chars().find(|c| !c.is_whitespace());
                if combined.contains("data:")
                    || combined.contains("event:")
                    || combined.starts_with(':')
                    || matches!(first_non_ws, Some('d' | 'e' | ':'))
                {
                    let mut parser = SseParser::new();
                    let events = parser.push_str(combined);
                    self.mode = DecoderMode::Sse(parser);
                    self.pending.clear();
                    return events
                        .into_iter()
                        .filter(|event| !event.data.is_empty())
                        .map(|event| event.data)
                        .collect();
                }
                if matches!(first_non_ws, Some('[')) {
                    let mut parser = JsonArrayDecoder::new();
                    let events = parser.push_str(combined);
                    self.mode = DecoderMode::JsonArray(parser);
                    self.pending.clear();
                    return events;
                }
                if matches!(first_non_ws, Some('{')) {
                    let mut buffer = String::new();
                    buffer.push_str(combined);
                    let events = drain_ndjson(&mut buffer);
                    self.mode = DecoderMode::Ndjson(buffer);
                    self.pending.clear();
                    return events;
                }
                Vec::new()
            }
            DecoderMode::Sse(parser) => parser
                .push_str(text)
                .into_iter()
                .filter(|event| !event.data.is_empty())
                .map(|event| event.data)
                .collect(),
            DecoderMode::Ndjson(buffer) => {
                buffer.push_str(text);
                drain_ndjson(buffer)
            }
            DecoderMode::JsonArray(parser) => parser.push_str(text),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.mode {
            DecoderMode::Unknown => {
                let pending = self.pending.trim();
                if pending.is_empty() {
                    Vec::new()
                } else {
                    vec![pending.to_string()]
                }
            }
            DecoderMode::Sse(parser) => parser
                .finish()
                .into_iter()
                .filter(|event| !event.data.is_empty())
                .map(|event| event.data)
                .collect(),
            DecoderMode::Ndjson(buffer) => {
                let mut events = drain_ndjson(buffer);
                let remainder = buffer.trim();
                if !remainder.is_empty() {
                    events.push(remainder.to_string());
                }
                buffer.clear();
                events
            }
            DecoderMode::JsonArray(parser) => parser.finish(),
        }
    }
}

/// Incremental `[{...},{...}]` splitter for upstreams that stream a JSON
/// array instead of SSE.
#[derive(Debug)]
struct JsonArrayDecoder {
    current: String,
    depth: usize,
    in_string: bool,
    escape: bool,
    seen_array: bool,
}

impl JsonArrayDecoder {
    fn new() -> Self {
        Self {
            current: String::new(),
            depth: 0,
            in_string: false,
            escape: false,
            seen_array: false,
        }
    }

    fn push_str(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if !self.seen_array {
                if ch.is_whitespace() {
                    continue;
                }
                if ch == '[' {
                    self.seen_array = true;
                }
                continue;
            }

            if self.depth == 0 {
                if ch.is_whitespace() || ch == ',' {
                    continue;
                }
                if ch == '{' {
                    self.depth = 1;
                    self.current.push(ch);
                }
                continue;
            }

            self.current.push(ch);
            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if ch == '\\' {
                    self.escape = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 && !self.current.is_empty() {
                        out.push(std::mem::take(&mut self.current));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.depth == 0 && !self.current.trim().is_empty() {
            out.push(std::mem::take(&mut self.current));
        }
        out
    }
}

fn drain_ndjson(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        let Some(pos) = buffer.find('\n') else {
            break;
        };
        let mut line = buffer[..pos].to_string();
        buffer.drain(..=pos);
        if line.ends_with('\r') {
            line.pop();
        }
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    out
}

/// One streaming response: upstream dialect in, client dialect out.
pub struct StreamPump {
    decoder: StreamDecoder,
    encoder: StreamEncoder,
    upstream_dialect: Dialect,
    usage: Usage,
    stop_reason: Option<StopReason>,
    model: String,
    delivered_content: bool,
    finished: bool,
}

impl StreamPump {
    pub fn new(
        upstream_dialect: Dialect,
        client_dialect: Dialect,
        message_id: &str,
        model: &str,
    ) -> Self {
        Self {
            decoder: StreamDecoder::new(),
            encoder: StreamEncoder::new(client_dialect, message_id, model),
            upstream_dialect,
            usage: Usage::default(),
            stop_reason: None,
            model: model.to_string(),
            delivered_content: false,
            finished: false,
        }
    }

    /// Process one upstream chunk into client frames. A provider error
    /// object before any content surfaces as `Err` so the attempt can fall
    /// over to another credential; after content it is the caller's job to
    /// end the stream with [`error_frames`](Self::error_frames).
    pub fn push_chunk(&mut self, chunk: &Bytes) -> Result<Vec<Bytes>, Error> {
        let mut frames = Vec::new();
        for payload in self.decoder.push(chunk) {
            if let Some(error) = detect_stream_error(&payload) {
                if !self.delivered_content {
                    return Err(error);
                }
                frames.extend(self.encoder.encode_error(&error.message));
                self.finished = true;
                return Ok(frames);
            }
            if payload.trim() == "[DONE]" {
                continue;
            }
            for delta in polymux_protocol::chunk_to_deltas(self.upstream_dialect, &payload) {
                self.observe(&delta);
                frames.extend(self.encoder.encode(&delta));
            }
        }
        Ok(frames)
    }

    /// Flush the decoder and emit the client's closing frames.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        for payload in self.decoder.finish() {
            if payload.trim() == "[DONE]" {
                continue;
            }
            if detect_stream_error(&payload).is_some() {
                continue;
            }
            for delta in polymux_protocol::chunk_to_deltas(self.upstream_dialect, &payload) {
                self.observe(&delta);
                frames.extend(self.encoder.encode(&delta));
            }
        }
        frames.extend(self.encoder.finish());
        self.finished = true;
        frames
    }

    /// Synthetic error frames in the client's dialect, for failures after
    /// bytes were delivered (no retry possible).
    pub fn error_frames(&mut self, message: &str) -> Vec<Bytes> {
        self.finished = true;
        self.encoder.encode_error(message)
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn delivered_content(&self) -> bool {
        self.delivered_content
    }

    pub fn content_type(&self) -> &'static str {
        self.encoder.content_type()
    }

    /// Final-response view of the accumulated stream state, for accounting.
    pub fn summary(&self) -> ChatResponse {
        ChatResponse {
            model: self.model.clone(),
            blocks: Vec::new(),
            stop_reason: self.stop_reason.clone(),
            usage: self.usage,
        }
    }

    fn observe(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Start { model } => {
                if !model.is_empty() {
                    self.model = model.clone();
                }
            }
            StreamDelta::Finish { stop_reason, usage } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(reason.clone());
                }
                if let Some(usage) = usage {
                    self.usage.merge(usage);
                }
            }
            _ => {
                self.delivered_content = true;
            }
        }
    }
}

/// Provider error shapes that can appear inside a stream payload.
fn detect_stream_error(payload: &str) -> Option<Error> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    // Claude wraps errors as {"type":"error","error":{...}}; Gemini and
    // OpenAI put {"error":{"code"/"message"...}} at the top level.
    let status = error
        .get("code")
        .and_then(|code| code.as_u64())
        .map(|code| code as u16)
        .unwrap_or(502);
    let body = serde_json::to_vec(&value).unwrap_or_default();
    Some(classify_status(status, None, &body))
}
