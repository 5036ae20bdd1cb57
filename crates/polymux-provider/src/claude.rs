//! Claude subscription executor (Anthropic messages API over OAuth).

use std::time::Duration;

use async_trait::async_trait;

use polymux_auth::{Auth, RefreshError};
use polymux_protocol::{ChatRequest, Dialect};

use crate::fingerprint;
use crate::oauth;
use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const API_BASE: &str = "https://api.anthropic.com";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const TOKEN_UA: &str = "claude-cli/1.0.83 (external, cli)";

/// Anthropic OAuth tokens live ~8 h; renew well ahead so a burst of traffic
/// never lands on an expired token.
const REFRESH_LEAD: Duration = Duration::from_secs(4 * 3600);

pub struct ClaudeExecutor;

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Claude
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(REFRESH_LEAD)
    }

    fn build_request(
        &self,
        auth: &Auth,
        request: &ChatRequest,
        model_id: &str,
    ) -> ExecutorResult<UpstreamRequest> {
        let access_token = auth
            .metadata
            .access_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ExecutorError::MissingCredentialField("access_token"))?;

        let mut upstream = request.clone();
        upstream.model = model_id.to_string();
        let body = polymux_protocol::ir_to_request(Dialect::Claude, &upstream);

        let mut headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {access_token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        header_set(&mut headers, "anthropic-beta", OAUTH_BETA);
        if request.stream {
            header_set(&mut headers, "Accept", "text/event-stream");
        } else {
            header_set(&mut headers, "Accept", "application/json");
        }
        fingerprint::apply_headers(&mut headers, &fingerprint::resolve(auth));

        Ok(UpstreamRequest {
            url: format!("{API_BASE}/v1/messages"),
            headers,
            body: serde_json::to_vec(&body)
                .map_err(|err| ExecutorError::Other(err.to_string()))?,
            dialect: Dialect::Claude,
            is_stream: request.stream,
        })
    }

    async fn refresh(&self, auth: &Auth, client: &wreq::Client) -> Result<Auth, RefreshError> {
        let refresh_token = oauth::require_refresh_token(auth)?;
        let body = oauth::refresh_json_body(CLIENT_ID, refresh_token);
        let tokens =
            oauth::post_refresh(client, TOKEN_URL, "application/json", body, TOKEN_UA).await?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::network("empty access_token in refresh response"));
        }
        Ok(oauth::apply_tokens(auth, &tokens))
    }
}
