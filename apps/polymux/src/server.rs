//! The client-facing HTTP surface: OpenAI, Anthropic, Gemini, and Ollama
//! dialects, all funneled through the manager.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use polymux_core::{Error, ErrorCategory, Execution, ExecutionStream, Manager};
use polymux_protocol::{ChatRequest, Dialect};

use crate::config::Config;

pub struct AppState {
    pub manager: Arc<Manager>,
    pub config: Arc<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_size;
    Router::new()
        // OpenAI surface
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/completions", post(openai_completions))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/models", get(openai_models))
        // Anthropic surface
        .route("/v1/messages", post(claude_messages))
        .route("/v1/messages/count_tokens", post(claude_count_tokens))
        // Gemini surface
        .route("/v1beta/models", get(gemini_models))
        .route("/v1beta/models/{model_action}", post(gemini_action))
        // Ollama surface
        .route("/api/chat", post(ollama_chat))
        .route("/api/generate", post(ollama_generate))
        .route("/api/tags", get(ollama_tags))
        .route("/api/show", post(ollama_show))
        .route("/api/version", get(ollama_version))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bearer token, x-api-key, or open access when auth is disabled.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if state.config.disable_auth || state.config.api_keys.is_empty() {
        return Ok(());
    }
    let presented = bearer_token(headers)
        .or_else(|| header_str(headers, "x-api-key"))
        .or_else(|| header_str(headers, "x-goog-api-key"));
    match presented {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => Ok(()),
        _ => Err(plain_error(
            StatusCode::UNAUTHORIZED,
            json!({"error": {"message": "invalid api key", "type": "authentication_error"}}),
        )),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Client affinity key for sticky sessions: the API key hash when present,
/// the forwarded address otherwise.
fn fingerprint(headers: &HeaderMap) -> String {
    if let Some(key) = bearer_token(headers).or_else(|| header_str(headers, "x-api-key")) {
        let digest = Sha256::digest(key.as_bytes());
        return format!("{digest:x}")[..16].to_string();
    }
    header_str(headers, "x-forwarded-for")
        .map(|addr| addr.split(',').next().unwrap_or(addr).trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

/// Providers worth trying for a model, most specific namespace first.
fn providers_for_model(state: &AppState, model: &str) -> Vec<String> {
    let available = state.manager.registry().providers();
    let lower = model.to_ascii_lowercase();
    let preferred: &[&str] = if lower.starts_with("claude") {
        &["claude", "antigravity"]
    } else if lower.starts_with("gemini") {
        &["gemini", "antigravity"]
    } else if lower.starts_with("gpt")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4")
        || lower.contains("codex")
    {
        &["codex", "copilot"]
    } else if lower.starts_with("qwen") {
        &["qwen", "iflow"]
    } else {
        &[]
    };

    let matched: Vec<String> = preferred
        .iter()
        .filter(|p| available.iter().any(|a| a == *p))
        .map(|p| p.to_string())
        .collect();
    if matched.is_empty() {
        available
    } else {
        matched
    }
}

async fn run(
    state: &AppState,
    headers: &HeaderMap,
    request: ChatRequest,
    dialect: Dialect,
) -> Result<Execution, Error> {
    let providers = providers_for_model(state, &request.model);
    let fp = fingerprint(headers);
    state
        .manager
        .execute(&providers, request, dialect, &fp)
        .await
}

fn stream_response(stream: ExecutionStream) -> Response {
    let ExecutionStream { content_type, rx } = stream;
    let body = Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<Bytes, std::convert::Infallible>(frame), rx))
    }));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn json_response(status: StatusCode, value: Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn plain_error(status: StatusCode, value: Value) -> Response {
    json_response(status, value)
}

/// Render a core error in the caller's dialect, preserving status and
/// Retry-After where they matter.
fn error_response(err: &Error, dialect: Dialect) -> Response {
    let status = StatusCode::from_u16(surface_status(err)).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match dialect {
        Dialect::OpenAi | Dialect::OpenAiResponses => json!({
            "error": {"message": err.message, "type": err.category.as_str(), "code": err.code},
        }),
        Dialect::Claude => json!({
            "type": "error",
            "error": {"type": claude_error_type(err), "message": err.message},
        }),
        Dialect::Gemini => json!({
            "error": {"code": status.as_u16(), "message": err.message, "status": gemini_status(err)},
        }),
        Dialect::Ollama => json!({"error": err.message}),
    };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(retry_after) = err.retry_after {
        builder = builder.header(header::RETRY_AFTER, retry_after.as_secs().to_string());
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn surface_status(err: &Error) -> u16 {
    match err.category {
        ErrorCategory::ClientCanceled => 499,
        ErrorCategory::AuthError if err.http_status == 503 => 503,
        // Upstream auth failures are the gateway's problem, not the
        // caller's; never forward a 401 from a dead credential.
        ErrorCategory::AuthError | ErrorCategory::AuthRevoked => 502,
        _ => {
            if err.http_status >= 400 {
                err.http_status
            } else {
                502
            }
        }
    }
}

fn claude_error_type(err: &Error) -> &'static str {
    match err.category {
        ErrorCategory::UserError => "invalid_request_error",
        ErrorCategory::QuotaError => "rate_limit_error",
        ErrorCategory::NotFound => "not_found_error",
        _ => "api_error",
    }
}

fn gemini_status(err: &Error) -> &'static str {
    match err.category {
        ErrorCategory::UserError => "INVALID_ARGUMENT",
        ErrorCategory::QuotaError => "RESOURCE_EXHAUSTED",
        ErrorCategory::NotFound => "NOT_FOUND",
        _ => "UNAVAILABLE",
    }
}

// ---- OpenAI handlers ----

async fn openai_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request = match polymux_protocol::request_to_ir(Dialect::OpenAi, &body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::OpenAi),
    };
    dispatch(&state, &headers, request, Dialect::OpenAi).await
}

/// Legacy text completions: wrap the prompt as a single user message.
async fn openai_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => return error_response(&Error::user(err.to_string()), Dialect::OpenAi),
    };
    let model = value.get("model").and_then(Value::as_str).unwrap_or_default();
    let prompt = value.get("prompt").and_then(Value::as_str).unwrap_or_default();
    if model.is_empty() {
        return error_response(&Error::user("missing model"), Dialect::OpenAi);
    }
    let chat_body = json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": value.get("max_tokens"),
        "temperature": value.get("temperature"),
        "stream": value.get("stream"),
    });
    let bytes = serde_json::to_vec(&chat_body).unwrap_or_default();
    let request = match polymux_protocol::request_to_ir(Dialect::OpenAi, &bytes) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::OpenAi),
    };
    dispatch(&state, &headers, request, Dialect::OpenAi).await
}

async fn openai_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request = match polymux_protocol::request_to_ir(Dialect::OpenAiResponses, &body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::OpenAiResponses),
    };
    dispatch(&state, &headers, request, Dialect::OpenAiResponses).await
}

async fn openai_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let data: Vec<Value> = visible_models(&state)
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": polymux_common::now_epoch_seconds(),
                "owned_by": "polymux",
            })
        })
        .collect();
    json_response(StatusCode::OK, json!({"object": "list", "data": data}))
}

// ---- Anthropic handlers ----

async fn claude_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request = match polymux_protocol::request_to_ir(Dialect::Claude, &body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::Claude),
    };
    dispatch(&state, &headers, request, Dialect::Claude).await
}

async fn claude_count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request = match polymux_protocol::request_to_ir(Dialect::Claude, &body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::Claude),
    };
    json_response(
        StatusCode::OK,
        json!({"input_tokens": estimate_tokens(&request)}),
    )
}

// ---- Gemini handlers ----

async fn gemini_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let models: Vec<Value> = visible_models(&state)
        .into_iter()
        .map(|id| {
            json!({
                "name": format!("models/{id}"),
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    json_response(StatusCode::OK, json!({"models": models}))
}

async fn gemini_action(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let (model, action) = match model_action.split_once(':') {
        Some((model, action)) => (model.to_string(), action.to_string()),
        None => {
            return error_response(&Error::user("missing model action"), Dialect::Gemini);
        }
    };

    let mut request = match polymux_protocol::request_to_ir(Dialect::Gemini, &body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::Gemini),
    };
    request.model = model;

    match action.as_str() {
        "generateContent" => {
            request.stream = false;
            dispatch(&state, &headers, request, Dialect::Gemini).await
        }
        "streamGenerateContent" => {
            request.stream = true;
            dispatch(&state, &headers, request, Dialect::Gemini).await
        }
        "countTokens" => json_response(
            StatusCode::OK,
            json!({"totalTokens": estimate_tokens(&request)}),
        ),
        _ => error_response(
            &Error::user(format!("unknown action {action}")),
            Dialect::Gemini,
        ),
    }
}

// ---- Ollama handlers ----

async fn ollama_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request = match polymux_protocol::request_to_ir(Dialect::Ollama, &body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::Ollama),
    };
    dispatch(&state, &headers, request, Dialect::Ollama).await
}

async fn ollama_generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let request = match polymux_protocol::ollama::generate_request_to_ir(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&Error::user(err.message), Dialect::Ollama),
    };
    dispatch(&state, &headers, request, Dialect::Ollama).await
}

async fn ollama_tags(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let models: Vec<Value> = visible_models(&state)
        .into_iter()
        .map(|id| {
            json!({
                "name": id,
                "model": id,
                "size": 0,
                "details": {"family": "polymux", "format": "api"},
            })
        })
        .collect();
    json_response(StatusCode::OK, json!({"models": models}))
}

async fn ollama_show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let value: Value = serde_json::from_slice(&body).unwrap_or(json!({}));
    let model = value
        .get("model")
        .or_else(|| value.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    json_response(
        StatusCode::OK,
        json!({
            "modelfile": format!("# proxied model {model}"),
            "details": {"family": "polymux", "format": "api"},
            "model_info": {},
            "capabilities": ["completion", "chat"],
        }),
    )
}

async fn ollama_version() -> Response {
    json_response(
        StatusCode::OK,
        json!({"version": env!("CARGO_PKG_VERSION")}),
    )
}

// ---- shared ----

async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    request: ChatRequest,
    dialect: Dialect,
) -> Response {
    let model = request.model.clone();
    let is_stream = request.stream;
    info!(model = %model, dialect = dialect.as_str(), is_stream, "request received");
    match run(state, headers, request, dialect).await {
        Ok(Execution::Json(ir)) => json_response(
            StatusCode::OK,
            polymux_protocol::ir_to_response(dialect, &ir),
        ),
        Ok(Execution::Stream(stream)) => stream_response(stream),
        Err(err) => error_response(&err, dialect),
    }
}

/// Rough token estimate used by the count-tokens endpoints; precise counts
/// only exist upstream.
fn estimate_tokens(request: &ChatRequest) -> i64 {
    let mut chars = 0usize;
    for message in &request.messages {
        for block in &message.blocks {
            match block {
                polymux_protocol::ContentBlock::Text { text }
                | polymux_protocol::ContentBlock::Thinking { text } => chars += text.len(),
                polymux_protocol::ContentBlock::ToolResult { content, .. } => {
                    chars += content.len()
                }
                polymux_protocol::ContentBlock::ToolUse { input, .. } => {
                    chars += input.to_string().len()
                }
                polymux_protocol::ContentBlock::Image { data, .. } => chars += data.len() / 100,
            }
        }
    }
    ((chars / 4) as i64).max(1)
}

fn visible_models(state: &AppState) -> Vec<String> {
    let providers = state.manager.registry().providers();
    let mut models: Vec<String> = Vec::new();
    for provider in &providers {
        models.extend(builtin_models(provider).iter().map(|m| m.to_string()));
    }
    // Canonical family names are addressable whenever any member provider
    // has credentials.
    for family in [
        "claude-sonnet-4-5",
        "claude-sonnet-4-5-thinking",
        "claude-opus-4-5",
        "claude-opus-4-5-thinking",
        "claude-sonnet-4",
        "claude-3-7-sonnet",
        "gpt-5.1-codex-max",
    ] {
        if polymux_protocol::resolve_providers(family, &providers).is_some() {
            models.push(family.to_string());
        }
    }
    models.sort();
    models.dedup();
    models
}

fn builtin_models(provider: &str) -> &'static [&'static str] {
    match provider {
        "claude" => &[
            "claude-sonnet-4-5-20250929",
            "claude-opus-4-5-20251101",
            "claude-haiku-4-5-20251001",
        ],
        "gemini" => &["gemini-2.5-pro", "gemini-2.5-flash", "gemini-3-pro"],
        "antigravity" => &["gemini-2.5-pro", "gemini-claude-sonnet-4-5"],
        "codex" => &["gpt-5.1-codex-max", "o3", "o4-mini"],
        "copilot" => &["gpt-4o", "gpt-4o-mini", "o3-mini"],
        "qwen" => &["qwen3-coder-plus", "qwen3-max"],
        "iflow" => &["qwen3-max", "deepseek-v3"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymux_auth::{Auth, AuthRegistry, QuotaManager, Selector, StickyStore};
    use polymux_core::ManagerConfig;
    use polymux_provider::ExecutorRegistry;

    fn state_with_auths(providers: &[&str]) -> Arc<AppState> {
        let quota = Arc::new(QuotaManager::new());
        let registry = Arc::new(AuthRegistry::new(None, Arc::clone(&quota)));
        for (i, provider) in providers.iter().enumerate() {
            registry.register(Auth::new(format!("a{i}"), *provider));
        }
        let selector = Selector::new(Arc::new(StickyStore::new()), quota);
        let manager = Manager::new(
            Arc::clone(&registry),
            selector,
            Arc::new(ExecutorRegistry::new(None)),
            Vec::new(),
            ManagerConfig::default(),
        );
        Arc::new(AppState {
            manager: Arc::new(manager),
            config: Arc::new(Config::default()),
        })
    }

    #[test]
    fn provider_routing_by_model_namespace() {
        let state = state_with_auths(&["claude", "gemini", "codex", "qwen"]);
        assert_eq!(providers_for_model(&state, "claude-sonnet-4-5"), vec!["claude"]);
        assert_eq!(providers_for_model(&state, "gemini-2.5-pro"), vec!["gemini"]);
        assert_eq!(providers_for_model(&state, "gpt-5.1-codex-max"), vec!["codex"]);
        assert_eq!(providers_for_model(&state, "qwen3-max"), vec!["qwen"]);
        // Unknown namespaces try everything that has credentials.
        let all = providers_for_model(&state, "mystery-model");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn fingerprint_prefers_api_key_hash() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-abc".parse().unwrap());
        let by_key = fingerprint(&headers);
        assert_eq!(by_key.len(), 16);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 10.0.0.1".parse().unwrap());
        assert_eq!(fingerprint(&headers), "10.1.2.3");

        assert_eq!(fingerprint(&HeaderMap::new()), "local");
    }

    #[test]
    fn authorize_accepts_configured_keys_only() {
        let state = state_with_auths(&[]);
        let mut config = Config::default();
        config.api_keys = vec!["sk-good".to_string()];
        let state = Arc::new(AppState {
            manager: Arc::clone(&state.manager),
            config: Arc::new(config),
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-good".parse().unwrap());
        assert!(authorize(&state, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-bad".parse().unwrap());
        assert!(authorize(&state, &headers).is_err());

        assert!(authorize(&state, &HeaderMap::new()).is_err());
    }

    #[test]
    fn visible_models_reflect_registered_providers() {
        let state = state_with_auths(&["claude"]);
        let models = visible_models(&state);
        assert!(models.contains(&"claude-sonnet-4-5-20250929".to_string()));
        assert!(models.contains(&"claude-sonnet-4-5".to_string()));
        assert!(!models.contains(&"gpt-4o".to_string()));
    }

    #[test]
    fn token_estimate_scales_with_content() {
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![polymux_protocol::Message::text(
                polymux_protocol::Role::User,
                "x".repeat(400),
            )],
            ..ChatRequest::default()
        };
        assert_eq!(estimate_tokens(&request), 100);
    }

    #[test]
    fn errors_render_in_the_callers_dialect() {
        let err = Error::all_cooling("claude-sonnet-4-5", std::time::Duration::from_secs(10800));
        let response = error_response(&err, Dialect::Claude);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("10800")
        );
    }
}
