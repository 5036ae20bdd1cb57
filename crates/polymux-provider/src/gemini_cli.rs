//! Gemini CLI executor (Cloud Code private API, Gemini dialect inside a
//! `{project, model, request}` envelope).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use polymux_auth::{Auth, RefreshError};
use polymux_protocol::sanitize::{gemini_cli_wrapper_spec, gemini_request_spec, sanitize_payload};
use polymux_protocol::{thinking, ChatRequest, Dialect};

use crate::oauth;
use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const API_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLI_UA: &str = "google-api-nodejs-client/9.15.1";

/// Google access tokens live one hour.
const REFRESH_LEAD: Duration = Duration::from_secs(15 * 60);

pub struct GeminiCliExecutor;

#[async_trait]
impl ProviderExecutor for GeminiCliExecutor {
    fn name(&self) -> &'static str {
        "gemini"
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
        thinking::strip_thinking_if_unsupported(&mut envelope, model_id);

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
        header_set(&mut headers, "User-Agent", CLI_UA);

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
        let client_secret = auth.metadata.client_secret.as_deref();
        let body = oauth::refresh_form_body(client_id, client_secret, refresh_token);
        let tokens = oauth::post_refresh(
            client,
            TOKEN_URL,
            "application/x-www-form-urlencoded",
            body,
            CLI_UA,
        )
        .await?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::network("empty access_token in refresh response"));
        }
        Ok(oauth::apply_tokens(auth, &tokens))
    }
}

pub(crate) fn build_inner_request(
    request: &ChatRequest,
    model_id: &str,
) -> ExecutorResult<serde_json::Value> {
    let mut upstream = request.clone();
    upstream.model = model_id.to_string();
    let inner = polymux_protocol::ir_to_request(Dialect::Gemini, &upstream);
    let payload =
        serde_json::to_vec(&inner).map_err(|err| ExecutorError::Other(err.to_string()))?;
    let (payload, report) = sanitize_payload(&payload, &gemini_request_spec());
    report.log_debug();
    serde_json::from_slice(&payload).map_err(|err| ExecutorError::Other(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_get;
    use polymux_protocol::{Message, Role, ThinkingConfig};

    fn auth() -> Auth {
        let mut auth = Auth::new("g1", "gemini");
        auth.metadata.access_token = Some("ya29.token".to_string());
        auth.metadata.project_id = Some("proj-42".to_string());
        auth
    }

    #[test]
    fn wraps_request_in_cli_envelope() {
        let request = ChatRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            stream: true,
            ..ChatRequest::default()
        };
        let upstream = GeminiCliExecutor
            .build_request(&auth(), &request, "gemini-2.5-pro")
            .unwrap();
        assert!(upstream.url.ends_with(":streamGenerateContent?alt=sse"));

        let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
        assert_eq!(body["project"], "proj-42");
        assert_eq!(body["model"], "gemini-2.5-pro");
        assert_eq!(body["request"]["contents"][0]["parts"][0]["text"], "hi");
        assert!(header_get(&upstream.headers, "authorization").unwrap().starts_with("Bearer ya29."));
    }

    #[test]
    fn gemini3_budget_becomes_thinking_level() {
        let request = ChatRequest {
            model: "gemini-3-pro".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            thinking: Some(ThinkingConfig {
                budget: Some(4096),
                include_thoughts: Some(true),
                level: None,
            }),
            ..ChatRequest::default()
        };
        let upstream = GeminiCliExecutor
            .build_request(&auth(), &request, "gemini-3-pro")
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
        let config = &body["request"]["generationConfig"]["thinkingConfig"];
        assert_eq!(config["thinkingLevel"], "HIGH");
        assert!(config.get("thinkingBudget").is_none());
    }

    #[test]
    fn non_thinking_model_loses_thinking_config() {
        let request = ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            thinking: Some(ThinkingConfig {
                budget: Some(1024),
                include_thoughts: None,
                level: None,
            }),
            ..ChatRequest::default()
        };
        let upstream = GeminiCliExecutor
            .build_request(&auth(), &request, "gemini-2.0-flash")
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
        assert!(body["request"]["generationConfig"]
            .get("thinkingConfig")
            .is_none());
    }

    #[test]
    fn missing_project_is_a_credential_error() {
        let mut auth = auth();
        auth.metadata.project_id = None;
        let request = ChatRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..ChatRequest::default()
        };
        let err = GeminiCliExecutor
            .build_request(&auth, &request, "gemini-2.5-pro")
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MissingCredentialField("project_id")));
    }
}
