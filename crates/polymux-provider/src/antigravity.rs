//! Antigravity executor. Same Cloud Code surface as the Gemini CLI but a
//! different client identity and its own model namespace
//! (`gemini-claude-*` aliases included).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use polymux_auth::{Auth, RefreshError};
use polymux_protocol::sanitize::{gemini_cli_wrapper_spec, sanitize_payload};
use polymux_protocol::{thinking, ChatRequest, Dialect};

use crate::gemini_cli::build_inner_request;
use crate::oauth;
use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const API_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const ANTIGRAVITY_UA: &str = "antigravity/0.4.0 (linux x64)";

const REFRESH_LEAD: Duration = Duration::from_secs(15 * 60);

pub struct AntigravityExecutor;

#[async_trait]
impl ProviderExecutor for AntigravityExecutor {
    fn name(&self) -> &'static str {
        "antigravity"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Gemini
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
        let project_id = auth
            .metadata
            .project_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(ExecutorError::MissingCredentialField("project_id"))?;

        let inner = build_inner_request(request, model_id)?;
        let mut envelope = json!({
            "model": model_id,
            "project": project_id,
            "request": inner,
        });
        thinking::reshape_thinking_config(&mut envelope, model_id, "request");

        let payload = serde_json::to_vec(&envelope)
            .map_err(|err| ExecutorError::Other(err.to_string()))?;
        let (payload, report) = sanitize_payload(&payload, &gemini_cli_wrapper_spec());
        report.log_debug();

        let action = if request.stream {
            ":streamGenerateContent?alt=sse"
        } else {
            ":generateContent"
        };

        let mut headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {access_token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "User-Agent", ANTIGRAVITY_UA);

        Ok(UpstreamRequest {
            url: format!("{API_BASE}{action}"),
            headers,
            body: payload,
            dialect: Dialect::Gemini,
            is_stream: request.stream,
        })
    }

    async fn refresh(&self, auth: &Auth, client: &wreq::Client) -> Result<Auth, RefreshError> {
        let refresh_token = oauth::require_refresh_token(auth)?;
        let client_id = auth
            .metadata
            .client_id
            .as_deref()
            .ok_or_else(|| RefreshError::network("missing client_id".to_string()))?;
        let body = oauth::refresh_form_body(
            client_id,
            auth.metadata.client_secret.as_deref(),
            refresh_token,
        );
        let tokens = oauth::post_refresh(
            client,
            TOKEN_URL,
            "application/x-www-form-urlencoded",
            body,
            ANTIGRAVITY_UA,
        )
        .await?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::network("empty access_token in refresh response"));
        }
        Ok(oauth::apply_tokens(auth, &tokens))
    }
}
