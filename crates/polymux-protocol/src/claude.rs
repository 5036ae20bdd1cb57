//! Anthropic messages dialect <-> IR.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta,
    ThinkingConfig, ToolDefinition, Usage,
};
use crate::{EncoderState, TranslateError, TranslateResult};

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stop_sequences: Vec<String>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    thinking: Option<WireThinking>,
    #[serde(default)]
    tools: Vec<WireTool>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct WireThinking {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    budget_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

pub fn request_to_ir(body: &[u8]) -> TranslateResult<ChatRequest> {
    let wire: WireRequest = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid claude request: {err}")))?;

    let mut messages = Vec::new();
    if let Some(system) = &wire.system {
        let text = system_to_text(system);
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }
    for msg in wire.messages {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(TranslateError::new(format!("unknown role: {other}")));
            }
        };
        messages.push(Message {
            role,
            blocks: content_to_blocks(&msg.content),
        });
    }

    let thinking = wire.thinking.and_then(|t| {
        if t.kind == "enabled" {
            Some(ThinkingConfig {
                budget: t.budget_tokens,
                include_thoughts: Some(true),
                level: None,
            })
        } else {
            None
        }
    });

    Ok(ChatRequest {
        model: wire.model,
        messages,
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_tokens,
        stop: wire.stop_sequences,
        thinking,
        tools: wire
            .tools
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema.unwrap_or(json!({})),
            })
            .collect(),
        stream: wire.stream.unwrap_or(false),
        metadata: serde_json::Map::new(),
    })
}

fn system_to_text(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = Vec::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push(text.to_string());
                }
            }
            out.join("\n\n")
        }
        _ => String::new(),
    }
}

fn content_to_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
        Value::Array(parts) => parts.iter().filter_map(part_to_block).collect(),
        _ => Vec::new(),
    }
}

fn part_to_block(part: &Value) -> Option<ContentBlock> {
    match part.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentBlock::Text {
            text: part.get("text")?.as_str()?.to_string(),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            text: part.get("thinking")?.as_str()?.to_string(),
        }),
        "image" => {
            let source = part.get("source")?;
            Some(ContentBlock::Image {
                media_type: source.get("media_type")?.as_str()?.to_string(),
                data: source.get("data")?.as_str()?.to_string(),
            })
        }
        "tool_use" => Some(ContentBlock::ToolUse {
            id: part.get("id")?.as_str()?.to_string(),
            name: part.get("name")?.as_str()?.to_string(),
            input: part.get("input").cloned().unwrap_or(json!({})),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: part.get("tool_use_id")?.as_str()?.to_string(),
            content: tool_result_text(part.get("content")),
            is_error: part
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => None,
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

pub fn ir_to_request(request: &ChatRequest) -> Value {
    let mut messages = Vec::new();
    for message in request.non_system_messages() {
        let role = match message.role {
            Role::Assistant => "assistant",
            // Tool results travel as user-role content in this dialect.
            _ => "user",
        };
        messages.push(json!({
            "role": role,
            "content": blocks_to_content(&message.blocks),
        }));
    }

    let mut obj = serde_json::Map::new();
    obj.insert("model".to_string(), json!(request.model));
    // The dialect requires max_tokens; keep a generous floor.
    obj.insert(
        "max_tokens".to_string(),
        json!(request.max_tokens.unwrap_or(4096)),
    );
    obj.insert("messages".to_string(), json!(messages));
    if let Some(system) = request.system_text() {
        obj.insert("system".to_string(), json!(system));
    }
    if let Some(temperature) = request.temperature {
        obj.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        obj.insert("top_p".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        obj.insert("stop_sequences".to_string(), json!(request.stop));
    }
    if request.stream {
        obj.insert("stream".to_string(), json!(true));
    }
    if let Some(thinking) = &request.thinking {
        if let Some(budget) = thinking.budget {
            if budget != 0 {
                obj.insert(
                    "thinking".to_string(),
                    json!({"type": "enabled", "budget_tokens": budget.max(1024)}),
                );
            }
        }
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect();
        obj.insert("tools".to_string(), json!(tools));
    }
    Value::Object(obj)
}

fn blocks_to_content(blocks: &[ContentBlock]) -> Value {
    if blocks.len() == 1 {
        if let ContentBlock::Text { text } = &blocks[0] {
            return json!(text);
        }
    }
    let parts: Vec<Value> = blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Thinking { text } => json!({"type": "thinking", "thinking": text}),
            ContentBlock::Image { media_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use", "id": id, "name": name, "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect();
    Value::Array(parts)
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
}

fn usage_to_ir(usage: &WireUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens
            + usage.cache_read_input_tokens
            + usage.cache_creation_input_tokens,
        output_tokens: usage.output_tokens,
        cached_tokens: usage.cache_read_input_tokens,
        reasoning_tokens: 0,
    }
}

fn stop_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Other,
    }
}

fn stop_reason_from_ir(reason: &StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
        StopReason::ContentFilter => "end_turn",
        StopReason::Other => "end_turn",
    }
}

pub fn response_to_ir(body: &[u8]) -> TranslateResult<ChatResponse> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid claude response: {err}")))?;
    Ok(ChatResponse {
        model: wire.model,
        blocks: wire.content.iter().filter_map(part_to_block).collect(),
        stop_reason: wire.stop_reason.as_deref().map(stop_reason_to_ir),
        usage: wire.usage.as_ref().map(usage_to_ir).unwrap_or_default(),
    })
}

pub fn ir_to_response(response: &ChatResponse) -> Value {
    let content: Vec<Value> = response
        .blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentBlock::Thinking { text } => {
                Some(json!({"type": "thinking", "thinking": text, "signature": ""}))
            }
            ContentBlock::ToolUse { id, name, input } => {
                Some(json!({"type": "tool_use", "id": id, "name": name, "input": input}))
            }
            _ => None,
        })
        .collect();

    json!({
        "id": format!("msg_{}", polymux_common::fnv32a(&response.model)),
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content,
        "stop_reason": response
            .stop_reason
            .as_ref()
            .map(stop_reason_from_ir)
            .unwrap_or("end_turn"),
        "stop_sequence": null,
        "usage": {
            "input_tokens": response.usage.input_tokens - response.usage.cached_tokens,
            "output_tokens": response.usage.output_tokens,
            "cache_read_input_tokens": response.usage.cached_tokens,
            "cache_creation_input_tokens": 0,
        },
    })
}

pub fn chunk_to_deltas(data: &str) -> Vec<StreamDelta> {
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let mut deltas = Vec::new();
    match event.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            let model = event
                .pointer("/message/model")
                .and_then(Value::as_str)
                .unwrap_or_default();
            deltas.push(StreamDelta::Start {
                model: model.to_string(),
            });
            if let Some(usage) = event.pointer("/message/usage") {
                if let Ok(wire) = serde_json::from_value::<WireUsage>(usage.clone()) {
                    deltas.push(StreamDelta::Finish {
                        stop_reason: None,
                        usage: Some(usage_to_ir(&wire)),
                    });
                }
            }
        }
        Some("content_block_start") => {
            if let Some(block) = event.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    deltas.push(StreamDelta::ToolUseStart {
                        index: event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize,
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
        }
        Some("content_block_delta") => {
            let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            if let Some(delta) = event.get("delta") {
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            deltas.push(StreamDelta::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            deltas.push(StreamDelta::Thinking {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            deltas.push(StreamDelta::ToolInput {
                                index,
                                json: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        Some("message_delta") => {
            let stop_reason = event
                .pointer("/delta/stop_reason")
                .and_then(Value::as_str)
                .map(stop_reason_to_ir);
            let usage = event
                .get("usage")
                .and_then(|u| serde_json::from_value::<WireUsage>(u.clone()).ok())
                .map(|wire| usage_to_ir(&wire));
            deltas.push(StreamDelta::Finish { stop_reason, usage });
        }
        _ => {}
    }
    deltas
}

pub(crate) fn encode_delta(state: &mut EncoderState, delta: &StreamDelta) -> Vec<Bytes> {
    let mut frames = Vec::new();
    if !state.started {
        state.started = true;
        frames.push(crate::sse_named_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", state.message_id),
                    "type": "message",
                    "role": "assistant",
                    "model": state.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ));
    }
    match delta {
        StreamDelta::Start { model } => {
            if !model.is_empty() {
                state.model = model.clone();
            }
        }
        StreamDelta::Text { text } => {
            if state.thinking_block_open {
                frames.push(block_stop(state));
                state.thinking_block_open = false;
            }
            if !state.text_block_open {
                state.text_block_open = true;
                frames.push(crate::sse_named_frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": state.block_index,
                        "content_block": {"type": "text", "text": ""},
                    }),
                ));
            }
            frames.push(crate::sse_named_frame(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "text_delta", "text": text},
                }),
            ));
        }
        StreamDelta::Thinking { text } => {
            if state.text_block_open {
                frames.push(block_stop(state));
                state.text_block_open = false;
            }
            if !state.thinking_block_open {
                state.thinking_block_open = true;
                frames.push(crate::sse_named_frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": state.block_index,
                        "content_block": {"type": "thinking", "thinking": ""},
                    }),
                ));
            }
            frames.push(crate::sse_named_frame(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "thinking_delta", "thinking": text},
                }),
            ));
        }
        StreamDelta::ToolUseStart { id, name, .. } => {
            if state.text_block_open || state.thinking_block_open {
                frames.push(block_stop(state));
                state.text_block_open = false;
                state.thinking_block_open = false;
            }
            frames.push(crate::sse_named_frame(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": state.block_index,
                    "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                }),
            ));
        }
        StreamDelta::ToolInput { json: partial, .. } => {
            frames.push(crate::sse_named_frame(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "input_json_delta", "partial_json": partial},
                }),
            ));
        }
        StreamDelta::Finish { stop_reason, usage } => {
            if state.text_block_open || state.thinking_block_open {
                frames.push(block_stop(state));
                state.text_block_open = false;
                state.thinking_block_open = false;
            }
            let mut value = json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": stop_reason
                        .as_ref()
                        .map(stop_reason_from_ir)
                        .unwrap_or("end_turn"),
                    "stop_sequence": null,
                },
            });
            if let Some(usage) = usage {
                value["usage"] = json!({
                    "input_tokens": usage.input_tokens - usage.cached_tokens,
                    "output_tokens": usage.output_tokens,
                    "cache_read_input_tokens": usage.cached_tokens,
                });
            }
            frames.push(crate::sse_named_frame("message_delta", &value));
        }
    }
    frames
}

fn block_stop(state: &mut EncoderState) -> Bytes {
    let frame = crate::sse_named_frame(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": state.block_index}),
    );
    state.block_index += 1;
    frame
}

pub(crate) fn encode_finish(state: &mut EncoderState) -> Vec<Bytes> {
    let mut frames = Vec::new();
    if state.text_block_open || state.thinking_block_open {
        frames.push(block_stop(state));
        state.text_block_open = false;
        state.thinking_block_open = false;
    }
    frames.push(crate::sse_named_frame(
        "message_stop",
        &json!({"type": "message_stop"}),
    ));
    frames
}

pub(crate) fn encode_error(message: &str) -> Vec<Bytes> {
    vec![crate::sse_named_frame(
        "error",
        &json!({
            "type": "error",
            "error": {"type": "api_error", "message": message},
        }),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_maps_system_and_thinking() {
        let body = serde_json::to_vec(&json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "system": "stay factual",
            "messages": [{"role": "user", "content": "hello"}],
            "thinking": {"type": "enabled", "budget_tokens": 2048},
        }))
        .unwrap();
        let ir = request_to_ir(&body).unwrap();
        assert_eq!(ir.system_text().as_deref(), Some("stay factual"));
        assert_eq!(ir.thinking.as_ref().unwrap().budget, Some(2048));

        let out = ir_to_request(&ir);
        assert_eq!(out["system"], "stay factual");
        assert_eq!(out["thinking"]["budget_tokens"], 2048);
        // System prompt must not leak into the messages array.
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn response_usage_folds_cache_tokens_into_input() {
        let body = serde_json::to_vec(&json!({
            "model": "claude-sonnet-4-5-20250929",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 3,
                "cache_read_input_tokens": 90,
                "cache_creation_input_tokens": 0,
            },
        }))
        .unwrap();
        let ir = response_to_ir(&body).unwrap();
        assert_eq!(ir.usage.input_tokens, 100);
        assert_eq!(ir.usage.cached_tokens, 90);
    }

    #[test]
    fn stream_events_decode_in_order() {
        let start = chunk_to_deltas(
            r#"{"type":"message_start","message":{"model":"claude-sonnet-4-5","usage":{"input_tokens":12,"output_tokens":0}}}"#,
        );
        assert!(matches!(start[0], StreamDelta::Start { .. }));

        let text = chunk_to_deltas(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        );
        assert_eq!(text, vec![StreamDelta::Text { text: "ok".into() }]);

        let done = chunk_to_deltas(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
        );
        match &done[0] {
            StreamDelta::Finish { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.unwrap().output_tokens, 9);
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn encoder_brackets_text_blocks() {
        let mut encoder = crate::StreamEncoder::new(crate::Dialect::Claude, "t1", "claude-x");
        let frames = encoder.encode(&StreamDelta::Text { text: "a".into() });
        let joined: String = frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(joined.contains("message_start"));
        assert!(joined.contains("content_block_start"));
        assert!(joined.contains("text_delta"));

        let finish = encoder.finish();
        let joined: String = finish
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(joined.contains("content_block_stop"));
        assert!(joined.contains("message_stop"));
    }
}
