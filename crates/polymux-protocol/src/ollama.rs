//! Ollama chat/generate dialect <-> IR. NDJSON on the wire.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta, Usage,
};
use crate::{EncoderState, TranslateError, TranslateResult};

#[derive(Debug, Deserialize)]
struct WireChatRequest {
    model: String,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    options: Option<WireOptions>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireGenerateRequest {
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    options: Option<WireOptions>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireOptions {
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    num_predict: Option<i64>,
    #[serde(default)]
    stop: Option<Value>,
}

pub fn request_to_ir(body: &[u8]) -> TranslateResult<ChatRequest> {
    let wire: WireChatRequest = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid ollama request: {err}")))?;

    let mut messages = Vec::with_capacity(wire.messages.len());
    for msg in wire.messages {
        let role = match msg.role.as_str() {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        };
        let mut blocks = Vec::new();
        if !msg.content.is_empty() {
            blocks.push(ContentBlock::Text { text: msg.content });
        }
        for image in msg.images {
            blocks.push(ContentBlock::Image {
                media_type: "image/png".to_string(),
                data: image,
            });
        }
        messages.push(Message { role, blocks });
    }

    Ok(assemble(wire.model, messages, wire.options, wire.stream))
}

/// `/api/generate` — prompt + optional system collapse into messages.
pub fn generate_request_to_ir(body: &[u8]) -> TranslateResult<ChatRequest> {
    let wire: WireGenerateRequest = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid ollama request: {err}")))?;

    let mut messages = Vec::new();
    if let Some(system) = wire.system {
        if !system.is_empty() {
            messages.push(Message::text(Role::System, system));
        }
    }
    messages.push(Message::text(Role::User, wire.prompt));

    let mut request = assemble(wire.model, messages, wire.options, wire.stream);
    request
        .metadata
        .insert("ollama_endpoint".to_string(), json!("generate"));
    Ok(request)
}

fn assemble(
    model: String,
    messages: Vec<Message>,
    options: Option<WireOptions>,
    stream: Option<bool>,
) -> ChatRequest {
    ChatRequest {
        model,
        messages,
        temperature: options.as_ref().and_then(|o| o.temperature),
        top_p: options.as_ref().and_then(|o| o.top_p),
        max_tokens: options.as_ref().and_then(|o| o.num_predict),
        stop: options
            .as_ref()
            .and_then(|o| o.stop.as_ref())
            .map(stop_to_vec)
            .unwrap_or_default(),
        thinking: None,
        tools: Vec::new(),
        // Ollama streams by default.
        stream: stream.unwrap_or(true),
        metadata: serde_json::Map::new(),
    }
}

fn stop_to_vec(stop: &Value) -> Vec<String> {
    match stop {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn ir_to_request(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::User => "user",
            };
            let mut entry = json!({"role": role, "content": message.joined_text()});
            let images: Vec<&str> = message
                .blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Image { data, .. } => Some(data.as_str()),
                    _ => None,
                })
                .collect();
            if !images.is_empty() {
                entry["images"] = json!(images);
            }
            entry
        })
        .collect();

    let mut options = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        options.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        options.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        options.insert("num_predict".to_string(), json!(max_tokens));
    }
    if !request.stop.is_empty() {
        options.insert("stop".to_string(), json!(request.stop));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": request.stream,
    });
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    body
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<WireResponseMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: i64,
    #[serde(default)]
    eval_count: i64,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

fn done_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

pub fn response_to_ir(body: &[u8]) -> TranslateResult<ChatResponse> {
    let wire: WireChatResponse = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid ollama response: {err}")))?;

    let mut blocks = Vec::new();
    if let Some(message) = &wire.message {
        if let Some(thinking) = &message.thinking {
            if !thinking.is_empty() {
                blocks.push(ContentBlock::Thinking {
                    text: thinking.clone(),
                });
            }
        }
        if !message.content.is_empty() {
            blocks.push(ContentBlock::Text {
                text: message.content.clone(),
            });
        }
    } else if let Some(response) = &wire.response {
        if !response.is_empty() {
            blocks.push(ContentBlock::Text {
                text: response.clone(),
            });
        }
    }

    Ok(ChatResponse {
        model: wire.model,
        blocks,
        stop_reason: wire.done_reason.as_deref().map(done_reason_to_ir),
        usage: Usage {
            input_tokens: wire.prompt_eval_count,
            output_tokens: wire.eval_count,
            cached_tokens: 0,
            reasoning_tokens: 0,
        },
    })
}

pub fn ir_to_response(response: &ChatResponse) -> Value {
    json!({
        "model": response.model,
        "created_at": rfc3339_now(),
        "message": {"role": "assistant", "content": response.joined_text()},
        "done": true,
        "done_reason": match response.stop_reason {
            Some(StopReason::MaxTokens) => "length",
            _ => "stop",
        },
        "prompt_eval_count": response.usage.input_tokens,
        "eval_count": response.usage.output_tokens,
    })
}

pub fn chunk_to_deltas(data: &str) -> Vec<StreamDelta> {
    let Ok(wire) = serde_json::from_str::<WireChatResponse>(data) else {
        return Vec::new();
    };
    let mut deltas = Vec::new();
    if let Some(message) = &wire.message {
        if let Some(thinking) = &message.thinking {
            if !thinking.is_empty() {
                deltas.push(StreamDelta::Thinking {
                    text: thinking.clone(),
                });
            }
        }
        if !message.content.is_empty() {
            deltas.push(StreamDelta::Text {
                text: message.content.clone(),
            });
        }
    } else if let Some(response) = &wire.response {
        if !response.is_empty() {
            deltas.push(StreamDelta::Text {
                text: response.clone(),
            });
        }
    }
    if wire.done {
        deltas.push(StreamDelta::Finish {
            stop_reason: wire
                .done_reason
                .as_deref()
                .map(done_reason_to_ir)
                .or(Some(StopReason::EndTurn)),
            usage: Some(Usage {
                input_tokens: wire.prompt_eval_count,
                output_tokens: wire.eval_count,
                cached_tokens: 0,
                reasoning_tokens: 0,
            }),
        });
    }
    deltas
}

pub(crate) fn encode_delta(state: &mut EncoderState, delta: &StreamDelta) -> Vec<Bytes> {
    match delta {
        StreamDelta::Start { model } => {
            if !model.is_empty() {
                state.model = model.clone();
            }
            Vec::new()
        }
        StreamDelta::Text { text } => vec![crate::ndjson_frame(&json!({
            "model": state.model,
            "created_at": rfc3339_now(),
            "message": {"role": "assistant", "content": text},
            "done": false,
        }))],
        StreamDelta::Thinking { text } => vec![crate::ndjson_frame(&json!({
            "model": state.model,
            "created_at": rfc3339_now(),
            "message": {"role": "assistant", "content": "", "thinking": text},
            "done": false,
        }))],
        StreamDelta::ToolUseStart { .. } | StreamDelta::ToolInput { .. } => Vec::new(),
        StreamDelta::Finish { stop_reason, usage } => {
            let usage = usage.unwrap_or_default();
            vec![crate::ndjson_frame(&json!({
                "model": state.model,
                "created_at": rfc3339_now(),
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": match stop_reason {
                    Some(StopReason::MaxTokens) => "length",
                    _ => "stop",
                },
                "prompt_eval_count": usage.input_tokens,
                "eval_count": usage.output_tokens,
            }))]
        }
    }
}

pub(crate) fn encode_error(message: &str) -> Vec<Bytes> {
    vec![crate::ndjson_frame(&json!({"error": message, "done": true}))]
}

fn rfc3339_now() -> String {
    // Coarse RFC 3339 stamp; Ollama clients only display it.
    let secs = polymux_common::now_epoch_seconds();
    let days = secs / 86400;
    let (year, month, day) = civil_from_days(days);
    let rem = secs % 86400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_maps_options() {
        let body = serde_json::to_vec(&json!({
            "model": "llama3",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"temperature": 0.1, "num_predict": 64, "stop": ["\n"]},
            "stream": false,
        }))
        .unwrap();
        let ir = request_to_ir(&body).unwrap();
        assert_eq!(ir.max_tokens, Some(64));
        assert_eq!(ir.stop, vec!["\n"]);
        assert!(!ir.stream);
    }

    #[test]
    fn generate_request_builds_messages() {
        let body = serde_json::to_vec(&json!({
            "model": "llama3",
            "system": "speak french",
            "prompt": "bonjour",
        }))
        .unwrap();
        let ir = generate_request_to_ir(&body).unwrap();
        assert_eq!(ir.messages.len(), 2);
        assert_eq!(ir.messages[0].role, Role::System);
        assert!(ir.stream);
    }

    #[test]
    fn stream_line_decodes_done_with_counts() {
        let deltas = chunk_to_deltas(
            r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":12,"eval_count":34}"#,
        );
        match &deltas[0] {
            StreamDelta::Finish { usage, .. } => {
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 34);
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }
}
