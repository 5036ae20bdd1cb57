//! OpenAI Responses API dialect <-> IR.

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
    input: Option<Value>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    max_output_tokens: Option<i64>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    reasoning: Option<WireReasoning>,
}

#[derive(Debug, Deserialize)]
struct WireReasoning {
    #[serde(default)]
    effort: Option<String>,
}

pub fn request_to_ir(body: &[u8]) -> TranslateResult<ChatRequest> {
    let wire: WireRequest = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid responses request: {err}")))?;

    let mut messages = Vec::new();
    if let Some(instructions) = &wire.instructions {
        if !instructions.is_empty() {
            messages.push(Message::text(Role::System, instructions.clone()));
        }
    }
    match &wire.input {
        Some(Value::String(text)) => {
            messages.push(Message::text(Role::User, text.clone()));
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(message) = input_item_to_message(item) {
                    messages.push(message);
                }
            }
        }
        _ => {}
    }

    Ok(ChatRequest {
        model: wire.model,
        messages,
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_output_tokens,
        stop: Vec::new(),
        thinking: wire.reasoning.and_then(|r| r.effort).map(|effort| ThinkingConfig {
            level: Some(effort.to_ascii_uppercase()),
            ..ThinkingConfig::default()
        }),
        tools: wire.tools.iter().filter_map(tool_to_definition).collect(),
        stream: wire.stream.unwrap_or(false),
        metadata: serde_json::Map::new(),
    })
}

fn tool_to_definition(tool: &Value) -> Option<ToolDefinition> {
    // Responses tools are flat: {type:"function", name, description, parameters}.
    if tool.get("type").and_then(Value::as_str) != Some("function") {
        return None;
    }
    Some(ToolDefinition {
        name: tool.get("name")?.as_str()?.to_string(),
        description: tool
            .get("description")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        parameters: tool.get("parameters").cloned().unwrap_or(json!({})),
    })
}

fn input_item_to_message(item: &Value) -> Option<Message> {
    match item.get("type").and_then(Value::as_str) {
        None | Some("message") => {
            let role = match item.get("role").and_then(Value::as_str)? {
                "system" | "developer" => Role::System,
                "assistant" => Role::Assistant,
                _ => Role::User,
            };
            let mut blocks = Vec::new();
            match item.get("content") {
                Some(Value::String(text)) => blocks.push(ContentBlock::Text { text: text.clone() }),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            blocks.push(ContentBlock::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
            Some(Message { role, blocks })
        }
        Some("function_call") => Some(Message {
            role: Role::Assistant,
            blocks: vec![ContentBlock::ToolUse {
                id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .and_then(|args| serde_json::from_str(args).ok())
                    .unwrap_or(json!({})),
            }],
        }),
        Some("function_call_output") => Some(Message {
            role: Role::Tool,
            blocks: vec![ContentBlock::ToolResult {
                tool_use_id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                content: item
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_error: false,
            }],
        }),
        _ => None,
    }
}

pub fn ir_to_request(request: &ChatRequest) -> Value {
    let mut input = Vec::new();
    for message in request.non_system_messages() {
        for block in &message.blocks {
            match block {
                ContentBlock::Text { text } => {
                    let (role, part_type) = match message.role {
                        Role::Assistant => ("assistant", "output_text"),
                        _ => ("user", "input_text"),
                    };
                    input.push(json!({
                        "type": "message",
                        "role": role,
                        "content": [{"type": part_type, "text": text}],
                    }));
                }
                ContentBlock::ToolUse { id, name, input: args } => input.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": args.to_string(),
                })),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => input.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_use_id,
                    "output": content,
                })),
                _ => {}
            }
        }
    }

    let mut obj = serde_json::Map::new();
    obj.insert("model".to_string(), json!(request.model));
    obj.insert("input".to_string(), json!(input));
    if let Some(system) = request.system_text() {
        obj.insert("instructions".to_string(), json!(system));
    }
    if let Some(temperature) = request.temperature {
        obj.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        obj.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        obj.insert("max_output_tokens".to_string(), json!(max_tokens));
    }
    if request.stream {
        obj.insert("stream".to_string(), json!(true));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        obj.insert("tools".to_string(), json!(tools));
    }
    if let Some(thinking) = &request.thinking {
        if let Some(level) = &thinking.level {
            obj.insert(
                "reasoning".to_string(),
                json!({"effort": level.to_ascii_lowercase()}),
            );
        }
    }
    Value::Object(obj)
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    output: Vec<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<Value>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    input_tokens_details: Option<Value>,
    #[serde(default)]
    output_tokens_details: Option<Value>,
}

fn usage_to_ir(usage: &WireUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_tokens: usage
            .input_tokens_details
            .as_ref()
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
        reasoning_tokens: usage
            .output_tokens_details
            .as_ref()
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
    }
}

pub fn response_to_ir(body: &[u8]) -> TranslateResult<ChatResponse> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid responses response: {err}")))?;

    let mut blocks = Vec::new();
    let mut stop_reason = Some(StopReason::EndTurn);
    for item in &wire.output {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                if let Some(parts) = item.get("content").and_then(Value::as_array) {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            blocks.push(ContentBlock::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                }
            }
            Some("function_call") => {
                let arguments = item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                blocks.push(ContentBlock::ToolUse {
                    id: item
                        .get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: serde_json::from_str(arguments)
                        .unwrap_or(Value::String(arguments.to_string())),
                });
                stop_reason = Some(StopReason::ToolUse);
            }
            _ => {}
        }
    }
    if wire.status.as_deref() == Some("incomplete")
        && wire
            .incomplete_details
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(Value::as_str)
            == Some("max_output_tokens")
    {
        stop_reason = Some(StopReason::MaxTokens);
    }

    Ok(ChatResponse {
        model: wire.model,
        blocks,
        stop_reason,
        usage: wire.usage.as_ref().map(usage_to_ir).unwrap_or_default(),
    })
}

pub fn ir_to_response(response: &ChatResponse) -> Value {
    response_object(
        &format!("resp_{}", polymux_common::fnv32a(&response.model)),
        &response.model,
        "completed",
        &response.blocks,
        Some(response.usage),
    )
}

fn response_object(
    id: &str,
    model: &str,
    status: &str,
    blocks: &[ContentBlock],
    usage: Option<Usage>,
) -> Value {
    let mut output = Vec::new();
    let mut text_parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(json!({
                "type": "output_text",
                "text": text,
                "annotations": [],
            })),
            ContentBlock::ToolUse { id, name, input } => output.push(json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": input.to_string(),
                "status": "completed",
            })),
            _ => {}
        }
    }
    if !text_parts.is_empty() {
        output.insert(
            0,
            json!({
                "type": "message",
                "role": "assistant",
                "status": "completed",
                "content": text_parts,
            }),
        );
    }

    let mut body = json!({
        "id": id,
        "object": "response",
        "created_at": polymux_common::now_epoch_seconds(),
        "status": status,
        "model": model,
        "output": output,
    });
    if let Some(usage) = usage {
        body["usage"] = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "total_tokens": usage.total(),
            "input_tokens_details": {"cached_tokens": usage.cached_tokens},
            "output_tokens_details": {"reasoning_tokens": usage.reasoning_tokens},
        });
    }
    body
}

/// Decode Responses-API SSE payloads (upstreams that speak this dialect).
pub fn chunk_to_deltas(data: &str) -> Vec<StreamDelta> {
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let mut deltas = Vec::new();
    match event.get("type").and_then(Value::as_str) {
        Some("response.created") => {
            let model = event
                .pointer("/response/model")
                .and_then(Value::as_str)
                .unwrap_or_default();
            deltas.push(StreamDelta::Start {
                model: model.to_string(),
            });
        }
        Some("response.output_text.delta") => {
            if let Some(text) = event.get("delta").and_then(Value::as_str) {
                deltas.push(StreamDelta::Text {
                    text: text.to_string(),
                });
            }
        }
        Some("response.reasoning_summary_text.delta") => {
            if let Some(text) = event.get("delta").and_then(Value::as_str) {
                deltas.push(StreamDelta::Thinking {
                    text: text.to_string(),
                });
            }
        }
        Some("response.output_item.added") => {
            if let Some(item) = event.get("item") {
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    deltas.push(StreamDelta::ToolUseStart {
                        index: event
                            .get("output_index")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as usize,
                        id: item
                            .get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
        }
        Some("response.function_call_arguments.delta") => {
            if let Some(args) = event.get("delta").and_then(Value::as_str) {
                deltas.push(StreamDelta::ToolInput {
                    index: event
                        .get("output_index")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize,
                    json: args.to_string(),
                });
            }
        }
        Some("response.completed") => {
            let usage = event
                .pointer("/response/usage")
                .and_then(|u| serde_json::from_value::<WireUsage>(u.clone()).ok())
                .map(|wire| usage_to_ir(&wire));
            deltas.push(StreamDelta::Finish {
                stop_reason: Some(StopReason::EndTurn),
                usage,
            });
        }
        _ => {}
    }
    deltas
}

pub(crate) fn encode_delta(state: &mut EncoderState, delta: &StreamDelta) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let id = format!("resp_{}", state.message_id);
    if !state.started {
        state.started = true;
        frames.push(crate::sse_named_frame(
            "response.created",
            &json!({
                "type": "response.created",
                "response": response_object(&id, &state.model, "in_progress", &[], None),
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
            frames.push(crate::sse_named_frame(
                "response.output_text.delta",
                &json!({
                    "type": "response.output_text.delta",
                    "item_id": id,
                    "output_index": 0,
                    "content_index": 0,
                    "delta": text,
                }),
            ));
        }
        StreamDelta::Thinking { text } => {
            frames.push(crate::sse_named_frame(
                "response.reasoning_summary_text.delta",
                &json!({
                    "type": "response.reasoning_summary_text.delta",
                    "item_id": id,
                    "output_index": 0,
                    "delta": text,
                }),
            ));
        }
        StreamDelta::ToolUseStart { index, id: call_id, name } => {
            frames.push(crate::sse_named_frame(
                "response.output_item.added",
                &json!({
                    "type": "response.output_item.added",
                    "output_index": index,
                    "item": {
                        "type": "function_call",
                        "call_id": call_id,
                        "name": name,
                        "arguments": "",
                    },
                }),
            ));
        }
        StreamDelta::ToolInput { index, json: args } => {
            frames.push(crate::sse_named_frame(
                "response.function_call_arguments.delta",
                &json!({
                    "type": "response.function_call_arguments.delta",
                    "output_index": index,
                    "delta": args,
                }),
            ));
        }
        StreamDelta::Finish { usage, .. } => {
            let mut response = response_object(&id, &state.model, "completed", &[], *usage);
            if usage.is_none() {
                if let Some(obj) = response.as_object_mut() {
                    obj.remove("usage");
                }
            }
            frames.push(crate::sse_named_frame(
                "response.completed",
                &json!({"type": "response.completed", "response": response}),
            ));
        }
    }
    frames
}

pub(crate) fn encode_error(message: &str) -> Vec<Bytes> {
    vec![crate::sse_named_frame(
        "error",
        &json!({"type": "error", "code": "upstream_error", "message": message}),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_input_becomes_user_message() {
        let body = serde_json::to_vec(&json!({
            "model": "gpt-5.1-codex-max",
            "instructions": "be direct",
            "input": "review this diff",
            "max_output_tokens": 512,
        }))
        .unwrap();
        let ir = request_to_ir(&body).unwrap();
        assert_eq!(ir.system_text().as_deref(), Some("be direct"));
        assert_eq!(ir.messages.len(), 2);
        assert_eq!(ir.max_tokens, Some(512));
    }

    #[test]
    fn structured_input_round_trips_tool_traffic() {
        let body = serde_json::to_vec(&json!({
            "model": "gpt-5.1-codex-max",
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "weather?"}]},
                {"type": "function_call", "call_id": "c1", "name": "get_weather", "arguments": "{\"city\":\"Hanoi\"}"},
                {"type": "function_call_output", "call_id": "c1", "output": "32C"},
            ],
        }))
        .unwrap();
        let ir = request_to_ir(&body).unwrap();
        assert!(matches!(ir.messages[1].blocks[0], ContentBlock::ToolUse { .. }));
        assert!(matches!(ir.messages[2].blocks[0], ContentBlock::ToolResult { .. }));

        let out = ir_to_request(&ir);
        let input = out["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[2]["output"], "32C");
    }

    #[test]
    fn response_output_decodes_text_and_usage() {
        let body = serde_json::to_vec(&json!({
            "id": "resp_1",
            "model": "gpt-5.1-codex-max",
            "status": "completed",
            "output": [
                {"type": "message", "role": "assistant", "content": [
                    {"type": "output_text", "text": "done"},
                ]},
            ],
            "usage": {
                "input_tokens": 40,
                "output_tokens": 12,
                "input_tokens_details": {"cached_tokens": 8},
            },
        }))
        .unwrap();
        let ir = response_to_ir(&body).unwrap();
        assert_eq!(ir.joined_text(), "done");
        assert_eq!(ir.usage.cached_tokens, 8);

        let rendered = ir_to_response(&ir);
        assert_eq!(rendered["object"], "response");
        assert_eq!(rendered["output"][0]["content"][0]["text"], "done");
        assert_eq!(rendered["usage"]["total_tokens"], 52);
    }

    #[test]
    fn stream_events_decode() {
        let deltas =
            chunk_to_deltas(r#"{"type":"response.output_text.delta","delta":"hel"}"#);
        assert_eq!(deltas, vec![StreamDelta::Text { text: "hel".into() }]);

        let deltas = chunk_to_deltas(
            r#"{"type":"response.completed","response":{"usage":{"input_tokens":3,"output_tokens":9}}}"#,
        );
        match &deltas[0] {
            StreamDelta::Finish { usage, .. } => assert_eq!(usage.unwrap().output_tokens, 9),
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn encoder_emits_created_then_completed() {
        let mut encoder =
            crate::StreamEncoder::new(crate::Dialect::OpenAiResponses, "t1", "gpt-5.1-codex-max");
        let frames = encoder.encode(&StreamDelta::Text { text: "x".into() });
        let text: String = frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(text.contains("response.created"));
        assert!(text.contains("response.output_text.delta"));

        let frames = encoder.encode(&StreamDelta::Finish {
            stop_reason: Some(StopReason::EndTurn),
            usage: None,
        });
        let text: String = frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(text.contains("response.completed"));
    }
}
