//! OpenAI chat-completions dialect <-> IR.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
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
    messages: Vec<WireMessage>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    max_completion_tokens: Option<i64>,
    #[serde(default)]
    stop: Option<Value>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Vec<WireTool>,
    #[serde(default)]
    reasoning_effort: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "tool_call_type")]
    kind: String,
    function: WireFunctionCall,
}

fn tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    #[serde(rename = "type")]
    _kind: String,
    function: WireFunctionDef,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDef {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

pub fn request_to_ir(body: &[u8]) -> TranslateResult<ChatRequest> {
    let wire: WireRequest = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid openai request: {err}")))?;

    let mut messages = Vec::with_capacity(wire.messages.len());
    for msg in wire.messages {
        messages.push(message_to_ir(msg)?);
    }

    let mut metadata = serde_json::Map::new();
    if let Some(effort) = wire.reasoning_effort.clone() {
        metadata.insert("openai_reasoning_effort".to_string(), Value::String(effort));
    }

    Ok(ChatRequest {
        model: wire.model,
        messages,
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_completion_tokens.or(wire.max_tokens),
        stop: stop_to_vec(wire.stop),
        thinking: wire.reasoning_effort.map(|effort| ThinkingConfig {
            level: Some(effort.to_ascii_uppercase()),
            ..ThinkingConfig::default()
        }),
        tools: wire
            .tools
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters.unwrap_or(json!({})),
            })
            .collect(),
        stream: wire.stream.unwrap_or(false),
        metadata,
    })
}

fn message_to_ir(msg: WireMessage) -> TranslateResult<Message> {
    let role = match msg.role.as_str() {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => {
            return Err(TranslateError::new(format!("unknown role: {other}")));
        }
    };

    let mut blocks = Vec::new();
    if role == Role::Tool {
        let content = msg
            .content
            .as_ref()
            .and_then(content_as_text)
            .unwrap_or_default();
        blocks.push(ContentBlock::ToolResult {
            tool_use_id: msg.tool_call_id.unwrap_or_default(),
            content,
            is_error: false,
        });
        return Ok(Message { role, blocks });
    }

    match msg.content {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text { text });
            }
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(block) = content_part_to_block(&part) {
                    blocks.push(block);
                }
            }
        }
        _ => {}
    }

    for call in msg.tool_calls {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::String(call.function.arguments));
        blocks.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    Ok(Message { role, blocks })
}

fn content_part_to_block(part: &Value) -> Option<ContentBlock> {
    match part.get("type").and_then(Value::as_str) {
        Some("text") => part.get("text").and_then(Value::as_str).map(|text| {
            ContentBlock::Text {
                text: text.to_string(),
            }
        }),
        Some("image_url") => {
            let url = part.get("image_url")?.get("url")?.as_str()?;
            let (media_type, data) = split_data_url(url)?;
            Some(ContentBlock::Image { media_type, data })
        }
        _ => None,
    }
}

fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

fn content_as_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            Some(out)
        }
        _ => None,
    }
}

fn stop_to_vec(stop: Option<Value>) -> Vec<String> {
    match stop {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn ir_to_request(request: &ChatRequest) -> Value {
    let mut messages = Vec::new();
    for message in &request.messages {
        messages.extend(message_from_ir(message));
    }

    let mut obj = serde_json::Map::new();
    obj.insert("model".to_string(), json!(request.model));
    obj.insert("messages".to_string(), json!(messages));
    if let Some(temperature) = request.temperature {
        obj.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        obj.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        obj.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if !request.stop.is_empty() {
        obj.insert("stop".to_string(), json!(request.stop));
    }
    if request.stream {
        obj.insert("stream".to_string(), json!(true));
        obj.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        obj.insert("tools".to_string(), json!(tools));
    }
    if let Some(thinking) = &request.thinking {
        if let Some(level) = &thinking.level {
            obj.insert(
                "reasoning_effort".to_string(),
                json!(level.to_ascii_lowercase()),
            );
        }
    }
    Value::Object(obj)
}

fn message_from_ir(message: &Message) -> Vec<Value> {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    // Tool results become separate `tool` role entries; everything else
    // folds into one message.
    let mut out = Vec::new();
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &message.blocks {
        match block {
            ContentBlock::Text { text } => parts.push(json!({"type": "text", "text": text})),
            ContentBlock::Image { media_type, data } => parts.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{media_type};base64,{data}")}
            })),
            ContentBlock::Thinking { .. } => {}
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": input.to_string(),
                }
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(json!({
                "role": "tool",
                "tool_call_id": tool_use_id,
                "content": content,
            })),
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() || out.is_empty() {
        let content: Value = if parts.len() == 1 && parts[0].get("type").and_then(Value::as_str) == Some("text") {
            parts[0]["text"].clone()
        } else if parts.is_empty() {
            Value::Null
        } else {
            Value::Array(parts)
        };
        let mut entry = json!({"role": role, "content": content});
        if !tool_calls.is_empty() {
            entry["tool_calls"] = Value::Array(tool_calls);
        }
        out.insert(0, entry);
    }
    out
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireChoiceMessage>,
    #[serde(default)]
    delta: Option<WireChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireDeltaToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireDeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
    #[serde(default)]
    completion_tokens_details: Option<WireCompletionDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct WireCompletionDetails {
    #[serde(default)]
    reasoning_tokens: i64,
}

fn usage_to_ir(usage: &WireUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cached_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0),
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .map(|d| d.reasoning_tokens)
            .unwrap_or(0),
    }
}

fn finish_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::Other,
    }
}

fn finish_reason_from_ir(reason: &StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "stop",
        StopReason::MaxTokens => "length",
        StopReason::StopSequence => "stop",
        StopReason::ToolUse => "tool_calls",
        StopReason::ContentFilter => "content_filter",
        StopReason::Other => "stop",
    }
}

pub fn response_to_ir(body: &[u8]) -> TranslateResult<ChatResponse> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid openai response: {err}")))?;

    let mut blocks = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = wire.choices.first() {
        if let Some(message) = &choice.message {
            if let Some(reasoning) = &message.reasoning_content {
                if !reasoning.is_empty() {
                    blocks.push(ContentBlock::Thinking {
                        text: reasoning.clone(),
                    });
                }
            }
            if let Some(content) = &message.content {
                if !content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: content.clone(),
                    });
                }
            }
            for call in &message.tool_calls {
                let (name, arguments) = match &call.function {
                    Some(f) => (
                        f.name.clone().unwrap_or_default(),
                        f.arguments.clone().unwrap_or_default(),
                    ),
                    None => (String::new(), String::new()),
                };
                let input =
                    serde_json::from_str(&arguments).unwrap_or(Value::String(arguments));
                blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone().unwrap_or_default(),
                    name,
                    input,
                });
            }
        }
        stop_reason = choice
            .finish_reason
            .as_deref()
            .map(finish_reason_to_ir);
    }

    Ok(ChatResponse {
        model: wire.model,
        blocks,
        stop_reason,
        usage: wire.usage.as_ref().map(usage_to_ir).unwrap_or_default(),
    })
}

pub fn ir_to_response(response: &ChatResponse) -> Value {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in &response.blocks {
        match block {
            ContentBlock::Text { text } => content.push_str(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()},
            })),
            _ => {}
        }
    }

    let mut message = json!({"role": "assistant", "content": content});
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": format!("chatcmpl-{}", polymux_common::fnv32a(&response.model)),
        "object": "chat.completion",
        "created": polymux_common::now_epoch_seconds(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": response
                .stop_reason
                .as_ref()
                .map(finish_reason_from_ir)
                .unwrap_or("stop"),
        }],
        "usage": {
            "prompt_tokens": response.usage.input_tokens,
            "completion_tokens": response.usage.output_tokens,
            "total_tokens": response.usage.total(),
            "prompt_tokens_details": {"cached_tokens": response.usage.cached_tokens},
            "completion_tokens_details": {"reasoning_tokens": response.usage.reasoning_tokens},
        },
    })
}

pub fn chunk_to_deltas(data: &str) -> Vec<StreamDelta> {
    if data.trim() == "[DONE]" {
        return Vec::new();
    }
    let Ok(wire) = serde_json::from_str::<WireResponse>(data) else {
        return Vec::new();
    };

    let mut deltas = Vec::new();
    for choice in &wire.choices {
        if let Some(delta) = &choice.delta {
            if let Some(reasoning) = &delta.reasoning_content {
                if !reasoning.is_empty() {
                    deltas.push(StreamDelta::Thinking {
                        text: reasoning.clone(),
                    });
                }
            }
            if let Some(content) = &delta.content {
                if !content.is_empty() {
                    deltas.push(StreamDelta::Text {
                        text: content.clone(),
                    });
                }
            }
            for call in &delta.tool_calls {
                let index = call.index.unwrap_or(0);
                if let Some(function) = &call.function {
                    if let Some(name) = &function.name {
                        deltas.push(StreamDelta::ToolUseStart {
                            index,
                            id: call.id.clone().unwrap_or_default(),
                            name: name.clone(),
                        });
                    }
                    if let Some(arguments) = &function.arguments {
                        if !arguments.is_empty() {
                            deltas.push(StreamDelta::ToolInput {
                                index,
                                json: arguments.clone(),
                            });
                        }
                    }
                }
            }
        }
        if let Some(reason) = &choice.finish_reason {
            deltas.push(StreamDelta::Finish {
                stop_reason: Some(finish_reason_to_ir(reason)),
                usage: wire.usage.as_ref().map(usage_to_ir),
            });
        }
    }
    // Usage-only final chunk (stream_options.include_usage) has no choices.
    if wire.choices.is_empty() {
        if let Some(usage) = &wire.usage {
            deltas.push(StreamDelta::Finish {
                stop_reason: None,
                usage: Some(usage_to_ir(usage)),
            });
        }
    }
    deltas
}

pub(crate) fn encode_delta(state: &mut EncoderState, delta: &StreamDelta) -> Vec<Bytes> {
    let mut frames = Vec::new();
    if !state.started {
        state.started = true;
        frames.push(chunk_frame(state, json!({"role": "assistant", "content": ""}), None));
    }
    match delta {
        StreamDelta::Start { model } => {
            if !model.is_empty() {
                state.model = model.clone();
            }
        }
        StreamDelta::Text { text } => {
            frames.push(chunk_frame(state, json!({"content": text}), None));
        }
        StreamDelta::Thinking { text } => {
            frames.push(chunk_frame(state, json!({"reasoning_content": text}), None));
        }
        StreamDelta::ToolUseStart { index, id, name } => {
            frames.push(chunk_frame(
                state,
                json!({"tool_calls": [{
                    "index": index,
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": ""},
                }]}),
                None,
            ));
        }
        StreamDelta::ToolInput { index, json: args } => {
            frames.push(chunk_frame(
                state,
                json!({"tool_calls": [{
                    "index": index,
                    "function": {"arguments": args},
                }]}),
                None,
            ));
        }
        StreamDelta::Finish { stop_reason, usage } => {
            let reason = stop_reason
                .as_ref()
                .map(finish_reason_from_ir)
                .unwrap_or("stop");
            let mut value = json!({
                "id": format!("chatcmpl-{}", state.message_id),
                "object": "chat.completion.chunk",
                "created": state.created,
                "model": state.model,
                "choices": [{"index": 0, "delta": {}, "finish_reason": reason}],
            });
            if let Some(usage) = usage {
                value["usage"] = json!({
                    "prompt_tokens": usage.input_tokens,
                    "completion_tokens": usage.output_tokens,
                    "total_tokens": usage.total(),
                });
            }
            frames.push(crate::sse_frame(&value));
        }
    }
    frames
}

fn chunk_frame(state: &EncoderState, delta: Value, finish_reason: Option<&str>) -> Bytes {
    crate::sse_frame(&json!({
        "id": format!("chatcmpl-{}", state.message_id),
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": state.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    }))
}

pub(crate) fn encode_finish(_state: &mut EncoderState) -> Vec<Bytes> {
    vec![Bytes::from_static(b"data: [DONE]\n\n")]
}

pub(crate) fn encode_error(state: &EncoderState, message: &str) -> Vec<Bytes> {
    let mut frames = vec![crate::sse_frame(&json!({
        "id": format!("chatcmpl-{}", state.message_id),
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": state.model,
        "choices": [],
        "error": {"message": message, "type": "upstream_error"},
    }))];
    frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
    frames
}
