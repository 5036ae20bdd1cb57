//! Provider executors: per-provider request construction, auth headers,
//! outgoing fingerprints, and OAuth token refresh.
//!
//! Executors never perform request IO themselves; they build an
//! [`UpstreamRequest`] and the core layer sends it. Refresh IO lives here
//! because its shape is provider-private.

pub mod antigravity;
pub mod claude;
pub mod client;
pub mod codex;
pub mod copilot;
pub mod fingerprint;
pub mod gemini_cli;
pub mod iflow;
pub mod oauth;
pub mod qwen;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use polymux_auth::{Auth, RefreshDispatch, RefreshError};
use polymux_protocol::{ChatRequest, Dialect};

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Clone)]
pub enum ExecutorError {
    Unsupported(&'static str),
    InvalidConfig(String),
    MissingCredentialField(&'static str),
    Other(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Unsupported(what) => write!(f, "unsupported: {what}"),
            ExecutorError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ExecutorError::MissingCredentialField(field) => {
                write!(f, "missing credential field: {field}")
            }
            ExecutorError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ExecutorError {}

/// A fully-shaped upstream HTTP request, ready for the core IO layer.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Wire dialect of the upstream response.
    pub dialect: Dialect,
    pub is_stream: bool,
}

pub fn header_set(headers: &mut Vec<(String, String)>, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wire dialect this provider speaks upstream.
    fn dialect(&self) -> Dialect;

    /// How far ahead of expiry the refresher should renew tokens.
    fn refresh_lead(&self) -> Option<Duration> {
        None
    }

    /// Resolve the provider-specific model ID for a canonical name.
    fn resolve_model(&self, canonical: &str) -> String {
        polymux_protocol::translate_model(canonical, self.name())
    }

    /// Build the upstream HTTP request for an IR chat request.
    /// `model_id` is the already-resolved upstream model.
    fn build_request(
        &self,
        auth: &Auth,
        request: &ChatRequest,
        model_id: &str,
    ) -> ExecutorResult<UpstreamRequest>;

    /// Run the provider's OAuth refresh and return the auth with fresh
    /// tokens in its metadata.
    async fn refresh(&self, auth: &Auth, client: &wreq::Client) -> Result<Auth, RefreshError>;
}

/// The provider table. Built once at boot; shared everywhere.
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn ProviderExecutor>>,
    proxy: Option<String>,
}

impl ExecutorRegistry {
    pub fn new(proxy: Option<String>) -> Self {
        let mut executors: HashMap<&'static str, Arc<dyn ProviderExecutor>> = HashMap::new();
        for executor in [
            Arc::new(claude::ClaudeExecutor) as Arc<dyn ProviderExecutor>,
            Arc::new(codex::CodexExecutor),
            Arc::new(copilot::CopilotExecutor),
            Arc::new(gemini_cli::GeminiCliExecutor),
            Arc::new(antigravity::AntigravityExecutor),
            Arc::new(qwen::QwenExecutor),
            Arc::new(iflow::IflowExecutor),
        ] {
            executors.insert(executor.name(), executor);
        }
        Self { executors, proxy }
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.executors.keys().copied().collect();
        names.sort();
        names
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }
}

#[async_trait]
impl RefreshDispatch for ExecutorRegistry {
    async fn refresh(&self, auth: &Auth) -> Result<Auth, RefreshError> {
        let Some(executor) = self.get(&auth.provider) else {
            return Err(RefreshError::network(format!(
                "no executor for provider {}",
                auth.provider
            )));
        };
        let client = client::shared_client(client::ClientKind::Global, self.proxy())
            .map_err(|err| RefreshError::network(err.to_string()))?;
        executor.refresh(auth, &client).await
    }

    fn refresh_lead(&self, provider: &str) -> Option<Duration> {
        self.get(provider).and_then(|executor| executor.refresh_lead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_all_providers() {
        let registry = ExecutorRegistry::new(None);
        for provider in [
            "claude",
            "codex",
            "copilot",
            "gemini",
            "antigravity",
            "qwen",
            "iflow",
        ] {
            assert!(registry.get(provider).is_some(), "missing {provider}");
        }
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn refresh_lead_surfaces_per_provider() {
        let registry = ExecutorRegistry::new(None);
        assert_eq!(
            RefreshDispatch::refresh_lead(&registry, "claude"),
            Some(Duration::from_secs(4 * 3600))
        );
        assert!(RefreshDispatch::refresh_lead(&registry, "nonexistent").is_none());
    }

    #[test]
    fn header_set_replaces_case_insensitively() {
        let mut headers = vec![("User-Agent".to_string(), "a".to_string())];
        header_set(&mut headers, "user-agent", "b");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "USER-AGENT"), Some("b"));
    }
}
