//! The orchestrator: pick a credential, execute the upstream call, observe
//! the outcome, then retry on another credential, wait out a cooldown, or
//! surface the failure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use polymux_auth::{
    Auth, AuthRegistry, AuthResult, PickError, PickOptions, QuotaManager, Selector,
};
use polymux_common::now_epoch_seconds;
use polymux_protocol::{thinking, ChatRequest, ChatResponse, Dialect};
use polymux_provider::client::{shared_client, ClientKind};
use polymux_provider::{ExecutorError, ExecutorRegistry, ProviderExecutor, UpstreamRequest};

use crate::error::{classify_status, Error, ErrorCategory};
use crate::stream::StreamPump;
use crate::usage::{cost_usd, Counters, UsageRecord, UsageSink};

const COOLDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_attempts: u32,
    /// Upper bound on how long a request may sit waiting for a cooldown to
    /// lift before a 429 is surfaced.
    pub max_retry_interval: Duration,
    pub proxy: Option<String>,
    /// Cap on buffered and streamed response bytes.
    pub max_response_size: usize,
    /// Silence window after which a stream is torn down.
    pub stream_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_retry_interval: Duration::from_secs(30),
            proxy: None,
            max_response_size: 100 * 1024 * 1024,
            stream_timeout: Duration::from_secs(300),
        }
    }
}

pub struct ExecutionStream {
    pub content_type: &'static str,
    pub rx: mpsc::Receiver<Bytes>,
}

pub enum Execution {
    Json(ChatResponse),
    Stream(ExecutionStream),
}

pub struct Manager {
    registry: Arc<AuthRegistry>,
    selector: Selector,
    executors: Arc<ExecutorRegistry>,
    counters: Arc<Counters>,
    sinks: Vec<Arc<dyn UsageSink>>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(
        registry: Arc<AuthRegistry>,
        selector: Selector,
        executors: Arc<ExecutorRegistry>,
        sinks: Vec<Arc<dyn UsageSink>>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            executors,
            counters: Arc::new(Counters::new()),
            sinks,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AuthRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Execute an IR request against the given providers, in order.
    ///
    /// `client_dialect` decides the wire shape of streamed frames; JSON
    /// responses return as IR for the router to encode.
    pub async fn execute(
        &self,
        providers: &[String],
        request: ChatRequest,
        client_dialect: Dialect,
        fingerprint: &str,
    ) -> Result<Execution, Error> {
        let mut request = request;
        let client_model = request.model.clone();
        request.model = thinking::normalize_model(&client_model, &mut request.thinking);

        let providers = if polymux_protocol::families::is_canonical(&request.model) {
            polymux_protocol::resolve_providers(&request.model, providers)
                .unwrap_or_else(|| providers.to_vec())
        } else {
            providers.to_vec()
        };
        if providers.is_empty() {
            return Err(Error::user(format!("no provider serves model {}", request.model)));
        }

        let trace_id = Uuid::new_v4().to_string();
        let mut last_error: Option<Error> = None;
        let mut force_rotate = false;
        let mut attempt = 0u32;

        while attempt < self.config.max_attempts {
            let mut shortest_cooldown: Option<Duration> = None;
            let mut picked_any = false;

            for provider in &providers {
                let Some(executor) = self.executors.get(provider) else {
                    continue;
                };
                let candidates = self.registry.list_provider(provider);
                if candidates.is_empty() {
                    continue;
                }

                let options = PickOptions {
                    force_rotate: force_rotate || attempt > 0,
                    fingerprint: fingerprint.to_string(),
                };
                let auth = match self.selector.pick(provider, &request.model, &options, &candidates)
                {
                    Ok(auth) => auth,
                    Err(PickError::AuthNotFound) => continue,
                    Err(PickError::AllCooling { retry_after, .. }) => {
                        shortest_cooldown = Some(match shortest_cooldown {
                            Some(current) => current.min(retry_after),
                            None => retry_after,
                        });
                        continue;
                    }
                    Err(PickError::AllBlocked { provider }) => {
                        last_error = Some(Error::no_auth(&provider));
                        continue;
                    }
                };
                picked_any = true;
                attempt += 1;

                info!(
                    trace_id = %trace_id,
                    provider = %provider,
                    model = %request.model,
                    auth_id = %auth.id,
                    attempt,
                    "executing attempt"
                );
                match self
                    .attempt(provider, executor.as_ref(), &auth, &request, client_dialect, &trace_id)
                    .await
                {
                    Ok(execution) => return Ok(execution),
                    Err(err) => {
                        warn!(
                            trace_id = %trace_id,
                            provider = %provider,
                            auth_id = %auth.id,
                            category = err.category.as_str(),
                            status = err.http_status,
                            "attempt failed"
                        );
                        if err.category == ErrorCategory::ClientCanceled {
                            return Err(err);
                        }
                        let fallback = err.category.should_fallback();
                        last_error = Some(err);
                        if !fallback || attempt >= self.config.max_attempts {
                            return Err(last_error.unwrap_or_else(|| {
                                Error::transient("attempt failed")
                            }));
                        }
                        force_rotate = true;
                    }
                }
            }

            if !picked_any {
                if let Some(wait) = shortest_cooldown {
                    // Waiting only pays off for short cooldowns; anything
                    // longer surfaces as a 429 with Retry-After.
                    if wait <= self.config.max_retry_interval {
                        debug!(
                            trace_id = %trace_id,
                            wait_secs = wait.as_secs(),
                            "all credentials cooling, waiting"
                        );
                        if self
                            .wait_for_available_auth(&providers, &request.model, wait)
                            .await
                        {
                            force_rotate = true;
                            continue;
                        }
                    }
                    return Err(Error::all_cooling(&request.model, wait));
                }
                return Err(last_error
                    .unwrap_or_else(|| Error::no_auth(&providers.join(","))));
            }

            force_rotate = true;
        }

        Err(last_error.unwrap_or_else(|| Error::transient("retry budget exhausted")))
    }

    /// At least one auth usable for (providers, model) right now?
    pub fn has_available_auth(&self, providers: &[String], model: &str) -> bool {
        let now = now_epoch_seconds();
        for provider in providers {
            for auth in self.registry.list_provider(provider) {
                if !auth.is_pickable(model, now) {
                    continue;
                }
                if self
                    .registry
                    .quota()
                    .cooldown_remaining(&auth.id, now)
                    .is_some()
                {
                    continue;
                }
                return true;
            }
        }
        false
    }

    /// Shortest remaining cooldown across the candidate set.
    pub fn closest_cooldown_wait(&self, providers: &[String], model: &str) -> Option<Duration> {
        let now = now_epoch_seconds();
        let mut shortest: Option<i64> = None;
        for provider in providers {
            for auth in self.registry.list_provider(provider) {
                let mut candidate: Option<i64> = None;
                if auth.unavailable && auth.next_retry_after > now {
                    candidate = Some(auth.next_retry_after);
                }
                if let Some(state) = auth.model_states.get(model) {
                    if state.unavailable && state.next_retry_after > now {
                        candidate = Some(
                            candidate.map_or(state.next_retry_after, |c| c.min(state.next_retry_after)),
                        );
                    }
                }
                if let Some(state) = self.registry.quota().get_state(&auth.id) {
                    let until = state.cooldown_until();
                    if until > now {
                        candidate = Some(candidate.map_or(until, |c| c.min(until)));
                    }
                }
                if let Some(at) = candidate {
                    shortest = Some(shortest.map_or(at, |c| c.min(at)));
                }
            }
        }
        shortest.map(|at| Duration::from_secs((at - now).max(1) as u64))
    }

    /// Poll until a credential frees up or `max_wait` passes. Client
    /// cancellation drops the future, which is the context bound here.
    pub async fn wait_for_available_auth(
        &self,
        providers: &[String],
        model: &str,
        max_wait: Duration,
    ) -> bool {
        if max_wait.is_zero() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.has_available_auth(providers, model) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(COOLDOWN_POLL_INTERVAL).await;
        }
    }

    async fn attempt(
        &self,
        provider: &str,
        executor: &dyn ProviderExecutor,
        auth: &Auth,
        request: &ChatRequest,
        client_dialect: Dialect,
        trace_id: &str,
    ) -> Result<Execution, Error> {
        let model_id = executor.resolve_model(&request.model);
        let prepared = executor
            .build_request(auth, request, &model_id)
            .map_err(map_executor_error)?;

        let kind = if provider == "claude" {
            ClientKind::Claude
        } else {
            ClientKind::Global
        };
        let client = shared_client(kind, self.config.proxy.as_deref())
            .map_err(|err| Error::transient(err.to_string()))?;

        let guard = RequestGuard::begin(
            Arc::clone(self.registry.quota()),
            auth.id.clone(),
            provider.to_string(),
        );

        let started = std::time::Instant::now();
        debug!(
            trace_id = %trace_id,
            provider = %provider,
            model = %model_id,
            url = %prepared.url,
            is_stream = prepared.is_stream,
            "upstream request"
        );
        let response = match send_upstream(&client, &prepared).await {
            Ok(response) => response,
            Err(err) => {
                guard.end(0, true);
                self.mark_failure(auth, &request.model, provider, &err);
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        debug!(
            trace_id = %trace_id,
            provider = %provider,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream response"
        );

        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            let body = response.bytes().await.unwrap_or_default();
            let err = classify_status(status, retry_after.as_deref(), &body);
            guard.end(0, true);
            self.mark_failure(auth, &request.model, provider, &err);
            self.emit_usage(trace_id, auth, provider, &model_id, &Default::default(), false);
            return Err(err);
        }

        if !prepared.is_stream {
            let body = response
                .bytes()
                .await
                .map_err(|err| {
                    let error = Error::transient(err.to_string());
                    guard.end_ref(0, true);
                    self.mark_failure(auth, &request.model, provider, &error);
                    error
                })?;
            if body.len() > self.config.max_response_size {
                let error = Error::transient(format!(
                    "upstream response of {} bytes exceeds the configured cap",
                    body.len()
                ));
                guard.end(0, true);
                self.mark_failure(auth, &request.model, provider, &error);
                return Err(error);
            }
            let ir = polymux_protocol::response_to_ir(prepared.dialect, &body)
                .map_err(|err| Error::transient(err.to_string()))?;
            guard.end(ir.usage.total(), false);
            self.mark_success(auth, &request.model, provider);
            self.counters.record(false, &ir.usage);
            self.emit_usage(trace_id, auth, provider, &model_id, &ir.usage, true);
            return Ok(Execution::Json(ir));
        }

        self.pump_stream(
            provider,
            auth,
            request,
            prepared,
            client_dialect,
            trace_id,
            model_id,
            response,
            guard,
        )
        .await
    }

    /// Start draining the upstream stream. The first content-bearing frames
    /// are read eagerly so early provider errors can still fall over to
    /// another credential; after that the pump runs detached.
    #[allow(clippy::too_many_arguments)]
    async fn pump_stream(
        &self,
        provider: &str,
        auth: &Auth,
        request: &ChatRequest,
        prepared: UpstreamRequest,
        client_dialect: Dialect,
        trace_id: &str,
        model_id: String,
        response: wreq::Response,
        guard: RequestGuard,
    ) -> Result<Execution, Error> {
        let mut pump = StreamPump::new(prepared.dialect, client_dialect, trace_id, &model_id);
        let mut upstream = response.bytes_stream();
        let mut initial: Vec<Bytes> = Vec::new();
        let mut upstream_done = false;
        let stream_timeout = self.config.stream_timeout;
        let max_stream_bytes = self.config.max_response_size;

        while initial.is_empty() {
            match tokio::time::timeout(stream_timeout, upstream.next()).await {
                Ok(Some(Ok(chunk))) => match pump.push_chunk(&chunk) {
                    Ok(frames) => initial = frames,
                    Err(err) => {
                        guard.end(pump.usage().total(), true);
                        self.mark_failure(auth, &request.model, provider, &err);
                        return Err(err);
                    }
                },
                Ok(Some(Err(err))) => {
                    let error = Error::transient(err.to_string());
                    guard.end(pump.usage().total(), true);
                    self.mark_failure(auth, &request.model, provider, &error);
                    return Err(error);
                }
                Ok(None) => {
                    upstream_done = true;
                    break;
                }
                Err(_) => {
                    let error = Error::transient("upstream stream timed out");
                    guard.end(pump.usage().total(), true);
                    self.mark_failure(auth, &request.model, provider, &error);
                    return Err(error);
                }
            }
        }

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let content_type = pump.content_type();

        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);
        let sinks = self.sinks.clone();
        let auth_id = auth.id.clone();
        let provider_name = provider.to_string();
        let model = request.model.clone();
        let trace = trace_id.to_string();

        tokio::spawn(async move {
            let mut canceled = false;
            let mut sent_bytes = 0usize;
            for frame in initial {
                sent_bytes += frame.len();
                if tx.send(frame).await.is_err() {
                    canceled = true;
                    break;
                }
            }

            if !canceled && !upstream_done {
                loop {
                    match tokio::time::timeout(stream_timeout, upstream.next()).await {
                        Ok(Some(Ok(chunk))) => {
                            let frames = match pump.push_chunk(&chunk) {
                                Ok(frames) => frames,
                                // Early-error window has passed; end the
                                // stream with a best-effort error event.
                                Err(err) => pump.error_frames(&err.message),
                            };
                            for frame in frames {
                                sent_bytes += frame.len();
                                if tx.send(frame).await.is_err() {
                                    canceled = true;
                                    break;
                                }
                            }
                            if canceled {
                                break;
                            }
                            if sent_bytes > max_stream_bytes {
                                for frame in pump.error_frames("stream size cap exceeded") {
                                    let _ = tx.send(frame).await;
                                }
                                break;
                            }
                        }
                        Ok(Some(Err(err))) => {
                            for frame in pump.error_frames(&err.to_string()) {
                                let _ = tx.send(frame).await;
                            }
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            for frame in pump.error_frames("upstream stream timed out") {
                                let _ = tx.send(frame).await;
                            }
                            break;
                        }
                    }
                }
            }

            if !canceled {
                for frame in pump.finish() {
                    if tx.send(frame).await.is_err() {
                        canceled = true;
                        break;
                    }
                }
            }

            let usage = pump.usage();
            guard.end(usage.total(), false);
            if canceled {
                // Client went away: tear down without penalizing the auth
                // beyond the tokens already counted.
                debug!(trace_id = %trace, auth_id = %auth_id, "client canceled stream");
                return;
            }
            registry.mark_result(AuthResult {
                auth_id: auth_id.clone(),
                provider: provider_name.clone(),
                model: model.clone(),
                success: true,
                error: None,
            });
            counters.record(false, &usage);
            let record = UsageRecord {
                timestamp: now_epoch_seconds(),
                trace_id: trace,
                auth_id,
                provider: provider_name,
                cost_usd: cost_usd(
                    &model_id,
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.cached_tokens,
                ),
                model: model_id,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cached_tokens: usage.cached_tokens,
                reasoning_tokens: usage.reasoning_tokens,
                success: true,
            };
            for sink in &sinks {
                sink.write(&record);
            }
        });

        Ok(Execution::Stream(ExecutionStream { content_type, rx }))
    }

    fn mark_success(&self, auth: &Auth, model: &str, provider: &str) {
        self.registry.mark_result(AuthResult {
            auth_id: auth.id.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            success: true,
            error: None,
        });
    }

    fn mark_failure(&self, auth: &Auth, model: &str, provider: &str, error: &Error) {
        self.registry.mark_result(AuthResult {
            auth_id: auth.id.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            success: false,
            error: Some(error.into()),
        });
    }

    fn emit_usage(
        &self,
        trace_id: &str,
        auth: &Auth,
        provider: &str,
        model_id: &str,
        usage: &polymux_protocol::Usage,
        success: bool,
    ) {
        if self.sinks.is_empty() {
            return;
        }
        let record = UsageRecord {
            timestamp: now_epoch_seconds(),
            trace_id: trace_id.to_string(),
            auth_id: auth.id.clone(),
            provider: provider.to_string(),
            model: model_id.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_tokens: usage.cached_tokens,
            reasoning_tokens: usage.reasoning_tokens,
            success,
            cost_usd: cost_usd(
                model_id,
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_tokens,
            ),
        };
        for sink in &self.sinks {
            sink.write(&record);
        }
    }
}

async fn send_upstream(
    client: &wreq::Client,
    prepared: &UpstreamRequest,
) -> Result<wreq::Response, Error> {
    let mut builder = client.post(&prepared.url);
    for (name, value) in &prepared.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(prepared.body.clone())
        .send()
        .await
        .map_err(|err| Error::transient(err.to_string()))
}

fn map_executor_error(err: ExecutorError) -> Error {
    match err {
        ExecutorError::MissingCredentialField(field) => Error::new(
            ErrorCategory::AuthError,
            401,
            "credential_incomplete",
            format!("credential missing {field}"),
        ),
        ExecutorError::Unsupported(what) => Error::new(
            ErrorCategory::UserError,
            400,
            "unsupported",
            format!("unsupported operation: {what}"),
        ),
        ExecutorError::InvalidConfig(message) => {
            Error::new(ErrorCategory::Unknown, 500, "invalid_config", message)
        }
        ExecutorError::Other(message) => Error::transient(message),
    }
}

/// Pairs every request start with exactly one end, on every exit path.
struct RequestGuard {
    quota: Arc<QuotaManager>,
    auth_id: String,
    provider: String,
    done: std::cell::Cell<bool>,
}

impl RequestGuard {
    fn begin(quota: Arc<QuotaManager>, auth_id: String, provider: String) -> Self {
        quota.record_request_start(&auth_id);
        Self {
            quota,
            auth_id,
            provider,
            done: std::cell::Cell::new(false),
        }
    }

    fn end(self, tokens: i64, failed: bool) {
        self.end_ref(tokens, failed);
    }

    fn end_ref(&self, tokens: i64, failed: bool) {
        if self.done.replace(true) {
            return;
        }
        self.quota
            .record_request_end(&self.auth_id, &self.provider, tokens, failed);
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.done.get() {
            self.quota
                .record_request_end(&self.auth_id, &self.provider, 0, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymux_auth::{AuthRegistry, ResultError, StickyStore};

    fn manager() -> Manager {
        let quota = Arc::new(QuotaManager::new());
        let registry = Arc::new(AuthRegistry::new(None, Arc::clone(&quota)));
        let selector = Selector::new(Arc::new(StickyStore::new()), quota);
        Manager::new(
            registry,
            selector,
            Arc::new(ExecutorRegistry::new(None)),
            Vec::new(),
            ManagerConfig::default(),
        )
    }

    fn providers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn has_available_auth_checks_provider_and_state() {
        let m = manager();
        m.registry.register(Auth::new("a1", "claude"));
        let mut disabled = Auth::new("a2", "claude");
        disabled.disabled = true;
        m.registry.register(disabled);

        assert!(m.has_available_auth(&providers(&["claude"]), "m"));
        assert!(!m.has_available_auth(&providers(&["unknown"]), "m"));
        assert!(!m.has_available_auth(&[], "m"));
    }

    #[test]
    fn has_available_auth_respects_cooldowns() {
        let m = manager();
        let now = now_epoch_seconds();
        let mut cooling = Auth::new("a1", "claude");
        cooling.unavailable = true;
        cooling.next_retry_after = now + 3600;
        m.registry.register(cooling);
        assert!(!m.has_available_auth(&providers(&["claude"]), "m"));

        m.registry.register(Auth::new("a2", "claude"));
        assert!(m.has_available_auth(&providers(&["claude"]), "m"));
    }

    #[test]
    fn closest_cooldown_wait_finds_minimum() {
        let m = manager();
        let now = now_epoch_seconds();
        let mut a1 = Auth::new("a1", "claude");
        a1.unavailable = true;
        a1.next_retry_after = now + 30;
        m.registry.register(a1);
        let mut a2 = Auth::new("a2", "claude");
        a2.unavailable = true;
        a2.next_retry_after = now + 60;
        m.registry.register(a2);

        let wait = m.closest_cooldown_wait(&providers(&["claude"]), "m").unwrap();
        assert!(wait.as_secs() >= 25 && wait.as_secs() <= 35, "{wait:?}");
        assert!(m.closest_cooldown_wait(&providers(&["other"]), "m").is_none());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_available() {
        let m = manager();
        m.registry.register(Auth::new("a1", "claude"));
        assert!(
            m.wait_for_available_auth(&providers(&["claude"]), "m", Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn wait_zero_max_wait_is_noop() {
        let m = manager();
        assert!(
            m.wait_for_available_auth(&providers(&["none"]), "m", Duration::ZERO)
                .await
        );
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_frees_up() {
        let m = manager();
        let start = std::time::Instant::now();
        let ok = m
            .wait_for_available_auth(&providers(&["none"]), "m", Duration::from_millis(600))
            .await;
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn execute_with_no_providers_is_user_error() {
        let m = manager();
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            ..ChatRequest::default()
        };
        let err = m
            .execute(&[], request, Dialect::OpenAi, "fp")
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::UserError);
    }

    #[tokio::test]
    async fn execute_with_no_auths_reports_unavailable() {
        let m = manager();
        let request = ChatRequest {
            model: "claude-3-5-haiku".to_string(),
            ..ChatRequest::default()
        };
        let err = m
            .execute(&providers(&["claude"]), request, Dialect::Claude, "fp")
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::AuthError);
        assert_eq!(err.http_status, 503);
    }

    #[tokio::test]
    async fn execute_surfaces_cooldown_as_quota_error() {
        let m = manager();
        m.registry.register(Auth::new("c1", "claude"));
        m.registry.mark_result(AuthResult {
            auth_id: "c1".to_string(),
            provider: "claude".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            success: false,
            error: Some(ResultError {
                code: "rate_limited".to_string(),
                message: "Rate limit exceeded".to_string(),
                http_status: 429,
                retry_after: Some(Duration::from_secs(3 * 3600)),
            }),
        });

        let request = ChatRequest {
            model: "claude-sonnet-4-5-20250929".to_string(),
            ..ChatRequest::default()
        };
        let err = m
            .execute(&providers(&["claude"]), request, Dialect::Claude, "fp")
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::QuotaError);
        assert_eq!(err.http_status, 429);
        let retry_after = err.retry_after.unwrap();
        assert!(retry_after.as_secs() > 10_000, "{retry_after:?}");
    }

    #[test]
    fn request_guard_pairs_start_end_even_on_drop() {
        let quota = Arc::new(QuotaManager::new());
        {
            let _guard = RequestGuard::begin(Arc::clone(&quota), "a".to_string(), "claude".to_string());
            assert_eq!(quota.state("a").active_requests(), 1);
        }
        assert_eq!(quota.state("a").active_requests(), 0);

        let guard = RequestGuard::begin(Arc::clone(&quota), "a".to_string(), "claude".to_string());
        guard.end(100, false);
        assert_eq!(quota.state("a").active_requests(), 0);
        assert_eq!(quota.state("a").total_tokens_used(), 100);
    }
}
