//! Gemini generateContent dialect <-> IR.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta,
    ThinkingConfig, ToolDefinition, Usage,
};
use crate::{EncoderState, TranslateError, TranslateResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default)]
    contents: Vec<WireContent>,
    #[serde(default)]
    system_instruction: Option<WireContent>,
    #[serde(default)]
    generation_config: Option<WireGenerationConfig>,
    #[serde(default)]
    tools: Vec<Value>,
    /// Model is carried in the URL path; handlers inject it before parsing.
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    max_output_tokens: Option<i64>,
    #[serde(default)]
    stop_sequences: Vec<String>,
    #[serde(default)]
    thinking_config: Option<WireThinkingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThinkingConfig {
    #[serde(default)]
    thinking_budget: Option<i64>,
    #[serde(default, alias = "include_thoughts")]
    include_thoughts: Option<bool>,
    #[serde(default, alias = "thinking_level")]
    thinking_level: Option<String>,
}

pub fn request_to_ir(body: &[u8]) -> TranslateResult<ChatRequest> {
    let wire: WireRequest = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid gemini request: {err}")))?;

    let mut messages = Vec::new();
    if let Some(system) = &wire.system_instruction {
        let blocks = parts_to_blocks(&system.parts);
        if !blocks.is_empty() {
            messages.push(Message {
                role: Role::System,
                blocks,
            });
        }
    }
    for content in &wire.contents {
        let role = match content.role.as_deref() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        messages.push(Message {
            role,
            blocks: parts_to_blocks(&content.parts),
        });
    }

    let config = wire.generation_config;
    let thinking = config
        .as_ref()
        .and_then(|c| c.thinking_config.as_ref())
        .map(|t| ThinkingConfig {
            budget: t.thinking_budget,
            include_thoughts: t.include_thoughts,
            level: t.thinking_level.clone(),
        });

    Ok(ChatRequest {
        model: wire.model.unwrap_or_default(),
        messages,
        temperature: config.as_ref().and_then(|c| c.temperature),
        top_p: config.as_ref().and_then(|c| c.top_p),
        max_tokens: config.as_ref().and_then(|c| c.max_output_tokens),
        stop: config
            .as_ref()
            .map(|c| c.stop_sequences.clone())
            .unwrap_or_default(),
        thinking,
        tools: wire
            .tools
            .iter()
            .flat_map(tool_declarations)
            .collect(),
        stream: false,
        metadata: serde_json::Map::new(),
    })
}

fn tool_declarations(tool: &Value) -> Vec<ToolDefinition> {
    let Some(declarations) = tool
        .get("functionDeclarations")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    declarations
        .iter()
        .filter_map(|decl| {
            Some(ToolDefinition {
                name: decl.get("name")?.as_str()?.to_string(),
                description: decl
                    .get("description")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                parameters: decl.get("parameters").cloned().unwrap_or(json!({})),
            })
        })
        .collect()
}

fn parts_to_blocks(parts: &[Value]) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                blocks.push(ContentBlock::Thinking {
                    text: text.to_string(),
                });
            } else {
                blocks.push(ContentBlock::Text {
                    text: text.to_string(),
                });
            }
            continue;
        }
        if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
            if let (Some(mime), Some(data)) = (
                inline.get("mimeType").or_else(|| inline.get("mime_type")),
                inline.get("data"),
            ) {
                if let (Some(mime), Some(data)) = (mime.as_str(), data.as_str()) {
                    blocks.push(ContentBlock::Image {
                        media_type: mime.to_string(),
                        data: data.to_string(),
                    });
                }
            }
            continue;
        }
        if let Some(call) = part.get("functionCall") {
            blocks.push(ContentBlock::ToolUse {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: call.get("args").cloned().unwrap_or(json!({})),
            });
            continue;
        }
        if let Some(response) = part.get("functionResponse") {
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: response
                    .get("id")
                    .or_else(|| response.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                content: response
                    .get("response")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                is_error: false,
            });
        }
    }
    blocks
}

pub fn ir_to_request(request: &ChatRequest) -> Value {
    let mut contents = Vec::new();
    for message in request.non_system_messages() {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        contents.push(json!({
            "role": role,
            "parts": blocks_to_parts(&message.blocks),
        }));
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation_config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if !request.stop.is_empty() {
        generation_config.insert("stopSequences".to_string(), json!(request.stop));
    }
    if let Some(thinking) = &request.thinking {
        let mut config = serde_json::Map::new();
        if let Some(budget) = thinking.budget {
            config.insert("thinkingBudget".to_string(), json!(budget));
        }
        if let Some(include) = thinking.include_thoughts {
            config.insert("includeThoughts".to_string(), json!(include));
        }
        if let Some(level) = &thinking.level {
            config.insert("thinkingLevel".to_string(), json!(level));
        }
        if !config.is_empty() {
            generation_config.insert("thinkingConfig".to_string(), Value::Object(config));
        }
    }

    let mut obj = serde_json::Map::new();
    obj.insert("contents".to_string(), json!(contents));
    if let Some(system) = request.system_text() {
        obj.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }
    if !generation_config.is_empty() {
        obj.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        obj.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }
    Value::Object(obj)
}

fn blocks_to_parts(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"text": text}),
            ContentBlock::Thinking { text } => json!({"text": text, "thought": true}),
            ContentBlock::Image { media_type, data } => json!({
                "inlineData": {"mimeType": media_type, "data": data},
            }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "functionCall": {"id": id, "name": name, "args": input},
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => json!({
                "functionResponse": {
                    "name": tool_use_id,
                    "response": {"result": content},
                },
            }),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
    #[serde(default)]
    cached_content_token_count: i64,
    #[serde(default)]
    thoughts_token_count: i64,
}

fn usage_to_ir(usage: &WireUsageMetadata) -> Usage {
    Usage {
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
        cached_tokens: usage.cached_content_token_count,
        reasoning_tokens: usage.thoughts_token_count,
    }
}

fn finish_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => StopReason::ContentFilter,
        _ => StopReason::Other,
    }
}

fn finish_reason_from_ir(reason: &StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence | StopReason::ToolUse => "STOP",
        StopReason::MaxTokens => "MAX_TOKENS",
        StopReason::ContentFilter => "SAFETY",
        StopReason::Other => "OTHER",
    }
}

pub fn response_to_ir(body: &[u8]) -> TranslateResult<ChatResponse> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|err| TranslateError::new(format!("invalid gemini response: {err}")))?;

    let mut blocks = Vec::new();
    let mut stop_reason = None;
    if let Some(candidate) = wire.candidates.first() {
        if let Some(content) = &candidate.content {
            blocks = parts_to_blocks(&content.parts);
        }
        stop_reason = candidate.finish_reason.as_deref().map(finish_reason_to_ir);
    }

    Ok(ChatResponse {
        model: wire.model_version.unwrap_or_default(),
        blocks,
        stop_reason,
        usage: wire
            .usage_metadata
            .as_ref()
            .map(usage_to_ir)
            .unwrap_or_default(),
    })
}

pub fn ir_to_response(response: &ChatResponse) -> Value {
    json!({
        "candidates": [{
            "content": {
                "role": "model",
                "parts": blocks_to_parts(&response.blocks),
            },
            "finishReason": response
                .stop_reason
                .as_ref()
                .map(finish_reason_from_ir)
                .unwrap_or("STOP"),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": response.usage.input_tokens,
            "candidatesTokenCount": response.usage.output_tokens - response.usage.reasoning_tokens,
            "thoughtsTokenCount": response.usage.reasoning_tokens,
            "cachedContentTokenCount": response.usage.cached_tokens,
            "totalTokenCount": response.usage.total(),
        },
        "modelVersion": response.model,
    })
}

pub fn chunk_to_deltas(data: &str) -> Vec<StreamDelta> {
    let Ok(wire) = serde_json::from_str::<WireResponse>(data) else {
        return Vec::new();
    };
    let mut deltas = Vec::new();
    for candidate in &wire.candidates {
        if let Some(content) = &candidate.content {
            for block in parts_to_blocks(&content.parts) {
                match block {
                    ContentBlock::Text { text } => deltas.push(StreamDelta::Text { text }),
                    ContentBlock::Thinking { text } => {
                        deltas.push(StreamDelta::Thinking { text })
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        let index = deltas.len();
                        deltas.push(StreamDelta::ToolUseStart {
                            index,
                            id,
                            name,
                        });
                        deltas.push(StreamDelta::ToolInput {
                            index,
                            json: input.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }
        if let Some(reason) = &candidate.finish_reason {
            deltas.push(StreamDelta::Finish {
                stop_reason: Some(finish_reason_to_ir(reason)),
                usage: wire.usage_metadata.as_ref().map(usage_to_ir),
            });
        }
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
        StreamDelta::Text { text } => vec![crate::sse_frame(&json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "index": 0,
            }],
            "modelVersion": state.model,
        }))],
        StreamDelta::Thinking { text } => vec![crate::sse_frame(&json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text, "thought": true}]},
                "index": 0,
            }],
            "modelVersion": state.model,
        }))],
        StreamDelta::ToolUseStart { .. } => Vec::new(),
        StreamDelta::ToolInput { json: args, .. } => {
            let input: Value = serde_json::from_str(args).unwrap_or(json!({}));
            vec![crate::sse_frame(&json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"functionCall": {"name": "", "args": input}}]},
                    "index": 0,
                }],
                "modelVersion": state.model,
            }))]
        }
        StreamDelta::Finish { stop_reason, usage } => {
            let mut value = json!({
                "candidates": [{
                    "content": {"role": "model", "parts": []},
                    "finishReason": stop_reason
                        .as_ref()
                        .map(finish_reason_from_ir)
                        .unwrap_or("STOP"),
                    "index": 0,
                }],
                "modelVersion": state.model,
            });
            if let Some(usage) = usage {
                value["usageMetadata"] = json!({
                    "promptTokenCount": usage.input_tokens,
                    "candidatesTokenCount": usage.output_tokens - usage.reasoning_tokens,
                    "thoughtsTokenCount": usage.reasoning_tokens,
                    "totalTokenCount": usage.total(),
                });
            }
            vec![crate::sse_frame(&value)]
        }
    }
}

pub(crate) fn encode_error(message: &str) -> Vec<Bytes> {
    vec![crate::sse_frame(&json!({
        "error": {"code": 500, "message": message, "status": "INTERNAL"},
    }))]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_contents_and_thinking() {
        let body = serde_json::to_vec(&json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
            ],
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 256,
                "thinkingConfig": {"thinkingBudget": 1024, "includeThoughts": true},
            },
        }))
        .unwrap();
        let ir = request_to_ir(&body).unwrap();
        assert_eq!(ir.system_text().as_deref(), Some("be brief"));
        assert_eq!(ir.thinking.as_ref().unwrap().budget, Some(1024));
        assert_eq!(ir.max_tokens, Some(256));

        let out = ir_to_request(&ir);
        assert_eq!(out["generationConfig"]["thinkingConfig"]["thinkingBudget"], 1024);
        assert_eq!(out["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn response_splits_thought_parts() {
        let body = serde_json::to_vec(&json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "answer"},
                ]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 4,
                "thoughtsTokenCount": 11,
            },
            "modelVersion": "gemini-2.5-pro",
        }))
        .unwrap();
        let ir = response_to_ir(&body).unwrap();
        assert!(matches!(ir.blocks[0], ContentBlock::Thinking { .. }));
        assert!(matches!(ir.blocks[1], ContentBlock::Text { .. }));
        assert_eq!(ir.usage.output_tokens, 15);
        assert_eq!(ir.usage.reasoning_tokens, 11);
    }

    #[test]
    fn stream_chunk_emits_finish_with_usage() {
        let deltas = chunk_to_deltas(
            r#"{"candidates":[{"content":{"parts":[{"text":"x"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1}}"#,
        );
        assert_eq!(deltas.len(), 2);
        assert!(matches!(deltas[1], StreamDelta::Finish { .. }));
    }
}
