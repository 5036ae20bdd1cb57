//! Wire-format translation for polymux.
//!
//! Every client dialect (OpenAI, Anthropic, Gemini, Ollama) converts into the
//! canonical intermediate representation in [`ir`], and every upstream
//! executor converts back out of it. N inbound formats and M outbound formats
//! therefore cost N + M mappers instead of N x M.

pub mod claude;
pub mod families;
pub mod gemini;
pub mod ir;
pub mod ollama;
pub mod openai;
pub mod responses;
pub mod sanitize;
pub mod sse;
pub mod thinking;

use bytes::Bytes;

pub use families::{family_members, resolve_providers, translate_model, FamilyMember};
pub use ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta,
    ThinkingConfig, ToolDefinition, Usage,
};
pub use sanitize::{sanitize_payload, PayloadSpec, ValidationReport};
pub use sse::{SseEvent, SseParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    OpenAiResponses,
    Claude,
    Gemini,
    Ollama,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::OpenAiResponses => "openai-responses",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
            Dialect::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslateError {
    pub message: String,
}

impl TranslateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "translate: {}", self.message)
    }
}

impl std::error::Error for TranslateError {}

pub type TranslateResult<T> = Result<T, TranslateError>;

/// Parse a client request body into IR.
pub fn request_to_ir(dialect: Dialect, body: &[u8]) -> TranslateResult<ChatRequest> {
    match dialect {
        Dialect::OpenAi => openai::request_to_ir(body),
        Dialect::OpenAiResponses => responses::request_to_ir(body),
        Dialect::Claude => claude::request_to_ir(body),
        Dialect::Gemini => gemini::request_to_ir(body),
        Dialect::Ollama => ollama::request_to_ir(body),
    }
}

/// Render an IR request as an upstream request body.
pub fn ir_to_request(dialect: Dialect, request: &ChatRequest) -> serde_json::Value {
    match dialect {
        Dialect::OpenAi => openai::ir_to_request(request),
        Dialect::OpenAiResponses => responses::ir_to_request(request),
        Dialect::Claude => claude::ir_to_request(request),
        Dialect::Gemini => gemini::ir_to_request(request),
        Dialect::Ollama => ollama::ir_to_request(request),
    }
}

/// Parse a non-streaming upstream response into IR.
pub fn response_to_ir(dialect: Dialect, body: &[u8]) -> TranslateResult<ChatResponse> {
    match dialect {
        Dialect::OpenAi => openai::response_to_ir(body),
        Dialect::OpenAiResponses => responses::response_to_ir(body),
        Dialect::Claude => claude::response_to_ir(body),
        Dialect::Gemini => gemini::response_to_ir(body),
        Dialect::Ollama => ollama::response_to_ir(body),
    }
}

/// Render an IR response in a client dialect.
pub fn ir_to_response(dialect: Dialect, response: &ChatResponse) -> serde_json::Value {
    match dialect {
        Dialect::OpenAi => openai::ir_to_response(response),
        Dialect::OpenAiResponses => responses::ir_to_response(response),
        Dialect::Claude => claude::ir_to_response(response),
        Dialect::Gemini => gemini::ir_to_response(response),
        Dialect::Ollama => ollama::ir_to_response(response),
    }
}

/// Decode one upstream stream payload (the `data:` value of an SSE event or
/// one NDJSON line) into IR deltas. Unrecognized payloads decode to nothing.
pub fn chunk_to_deltas(dialect: Dialect, data: &str) -> Vec<StreamDelta> {
    match dialect {
        Dialect::OpenAi => openai::chunk_to_deltas(data),
        Dialect::OpenAiResponses => responses::chunk_to_deltas(data),
        Dialect::Claude => claude::chunk_to_deltas(data),
        Dialect::Gemini => gemini::chunk_to_deltas(data),
        Dialect::Ollama => ollama::chunk_to_deltas(data),
    }
}

/// Stateful encoder turning IR deltas back into a client dialect's stream
/// frames. One encoder instance serves exactly one response stream.
pub struct StreamEncoder {
    dialect: Dialect,
    state: EncoderState,
}

pub(crate) struct EncoderState {
    pub message_id: String,
    pub model: String,
    pub created: i64,
    pub started: bool,
    pub text_block_open: bool,
    pub thinking_block_open: bool,
    pub block_index: usize,
}

impl StreamEncoder {
    pub fn new(dialect: Dialect, message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            dialect,
            state: EncoderState {
                message_id: message_id.into(),
                model: model.into(),
                created: polymux_common::now_epoch_seconds(),
                started: false,
                text_block_open: false,
                thinking_block_open: false,
                block_index: 0,
            },
        }
    }

    /// Encode one delta. A single delta may produce several wire frames
    /// (e.g. Anthropic's block start/stop bracketing).
    pub fn encode(&mut self, delta: &StreamDelta) -> Vec<Bytes> {
        match self.dialect {
            Dialect::OpenAi => openai::encode_delta(&mut self.state, delta),
            Dialect::OpenAiResponses => responses::encode_delta(&mut self.state, delta),
            Dialect::Claude => claude::encode_delta(&mut self.state, delta),
            Dialect::Gemini => gemini::encode_delta(&mut self.state, delta),
            Dialect::Ollama => ollama::encode_delta(&mut self.state, delta),
        }
    }

    /// Trailing frames owed to the client after the upstream stream ends
    /// (e.g. OpenAI's `[DONE]` sentinel).
    pub fn finish(&mut self) -> Vec<Bytes> {
        match self.dialect {
            Dialect::OpenAi => openai::encode_finish(&mut self.state),
            Dialect::OpenAiResponses => Vec::new(),
            Dialect::Claude => claude::encode_finish(&mut self.state),
            Dialect::Gemini => Vec::new(),
            Dialect::Ollama => Vec::new(),
        }
    }

    /// Best-effort error frame in the client's dialect, for mid-stream
    /// upstream failures after bytes were already delivered.
    pub fn encode_error(&mut self, message: &str) -> Vec<Bytes> {
        match self.dialect {
            Dialect::OpenAi => openai::encode_error(&self.state, message),
            Dialect::OpenAiResponses => responses::encode_error(message),
            Dialect::Claude => claude::encode_error(message),
            Dialect::Gemini => gemini::encode_error(message),
            Dialect::Ollama => ollama::encode_error(message),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.dialect {
            Dialect::Ollama => "application/x-ndjson",
            _ => "text/event-stream",
        }
    }
}

pub(crate) fn sse_frame(value: &serde_json::Value) -> Bytes {
    let payload = value.to_string();
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(payload.as_bytes());
    data.extend_from_slice(b"\n\n");
    Bytes::from(data)
}

pub(crate) fn sse_named_frame(event: &str, value: &serde_json::Value) -> Bytes {
    let payload = value.to_string();
    let mut data = Vec::with_capacity(payload.len() + event.len() + 16);
    data.extend_from_slice(b"event: ");
    data.extend_from_slice(event.as_bytes());
    data.extend_from_slice(b"\ndata: ");
    data.extend_from_slice(payload.as_bytes());
    data.extend_from_slice(b"\n\n");
    Bytes::from(data)
}

pub(crate) fn ndjson_frame(value: &serde_json::Value) -> Bytes {
    let payload = value.to_string();
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.extend_from_slice(payload.as_bytes());
    data.push(b'\n');
    Bytes::from(data)
}
