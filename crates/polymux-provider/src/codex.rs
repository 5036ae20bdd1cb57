//! OpenAI Codex subscription executor (ChatGPT backend, OpenAI dialect).

use std::time::Duration;

use async_trait::async_trait;

use polymux_auth::{Auth, RefreshError};
use polymux_protocol::{ChatRequest, Dialect};

use crate::oauth;
use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const API_BASE: &str = "https://chatgpt.com/backend-api/codex";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const CODEX_UA: &str = "codex_cli_rs/0.42.0";

const REFRESH_LEAD: Duration = Duration::from_secs(12 * 3600);

pub struct CodexExecutor;

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn dialect(&self) -> Dialect {
        Dialect::OpenAi
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
        let body = polymux_protocol::ir_to_request(Dialect::OpenAi, &upstream);

        let mut headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {access_token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "User-Agent", CODEX_UA);
        header_set(&mut headers, "originator", "codex_cli_rs");
        if let Some(account_id) = auth.metadata.account_id.as_deref() {
            header_set(&mut headers, "chatgpt-account-id", account_id);
        }
        if request.stream {
            header_set(&mut headers, "Accept", "text/event-stream");
        }

        Ok(UpstreamRequest {
            url: format!("{API_BASE}/chat/completions"),
            headers,
            body: serde_json::to_vec(&body)
                .map_err(|err| ExecutorError::Other(err.to_string()))?,
            dialect: Dialect::OpenAi,
            is_stream: request.stream,
        })
    }

    async fn refresh(&self, auth: &Auth, client: &wreq::Client) -> Result<Auth, RefreshError> {
        let refresh_token = oauth::require_refresh_token(auth)?;
        let body = serde_json::to_vec(&serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": CLIENT_ID,
            "refresh_token": refresh_token,
            "scope": "openid profile email",
        }))
        .map_err(|err| RefreshError::network(err.to_string()))?;
        let tokens =
            oauth::post_refresh(client, TOKEN_URL, "application/json", body, CODEX_UA).await?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::network("empty access_token in refresh response"));
        }
        Ok(oauth::apply_tokens(auth, &tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_get;
    use polymux_protocol::{Message, Role};

    #[test]
    fn account_id_header_present_when_known() {
        let mut auth = Auth::new("x1", "codex");
        auth.metadata.access_token = Some("at".to_string());
        auth.metadata.account_id = Some("acc-9".to_string());

        let request = ChatRequest {
            model: "gpt-5.1-codex-max".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..ChatRequest::default()
        };
        let upstream = CodexExecutor
            .build_request(&auth, &request, "gpt-5.1-codex-max")
            .unwrap();
        assert_eq!(header_get(&upstream.headers, "chatgpt-account-id"), Some("acc-9"));
        assert_eq!(header_get(&upstream.headers, "originator"), Some("codex_cli_rs"));
        assert!(!upstream.is_stream);
    }
}
