//! Qwen Code executor (OpenAI dialect against the Qwen portal).

use std::time::Duration;

use async_trait::async_trait;

use polymux_auth::{Auth, RefreshError};
use polymux_protocol::{ChatRequest, Dialect};

use crate::oauth;
use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
const QWEN_UA: &str = "QwenCode/0.10.0 (linux; x64)";
const DEFAULT_BASE: &str = "https://portal.qwen.ai/v1";

const REFRESH_LEAD: Duration = Duration::from_secs(10 * 60);

pub struct QwenExecutor;

#[async_trait]
impl ProviderExecutor for QwenExecutor {
    fn name(&self) -> &'static str {
        "qwen"
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

        // Accounts may pin a resource endpoint from the OAuth handshake.
        let base = auth
            .metadata
            .extra
            .get("resource_url")
            .and_then(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .map(|v| {
                if v.starts_with("http") {
                    format!("{}/v1", v.trim_end_matches('/'))
                } else {
                    format!("https://{}/v1", v.trim_end_matches('/'))
                }
            })
            .unwrap_or_else(|| DEFAULT_BASE.to_string());

        let mut upstream = request.clone();
        upstream.model = model_id.to_string();
        let body = polymux_protocol::ir_to_request(Dialect::OpenAi, &upstream);

        let mut headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {access_token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "User-Agent", QWEN_UA);

        Ok(UpstreamRequest {
            url: format!("{base}/chat/completions"),
            headers,
            body: serde_json::to_vec(&body)
                .map_err(|err| ExecutorError::Other(err.to_string()))?,
            dialect: Dialect::OpenAi,
            is_stream: request.stream,
        })
    }

    async fn refresh(&self, auth: &Auth, client: &wreq::Client) -> Result<Auth, RefreshError> {
        let refresh_token = oauth::require_refresh_token(auth)?;
        let body = oauth::refresh_form_body(CLIENT_ID, None, refresh_token);
        let tokens = oauth::post_refresh(
            client,
            TOKEN_URL,
            "application/x-www-form-urlencoded",
            body,
            QWEN_UA,
        )
        .await?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::network("empty access_token in refresh response"));
        }
        Ok(oauth::apply_tokens(auth, &tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymux_protocol::{Message, Role};

    #[test]
    fn resource_url_overrides_default_base() {
        let mut auth = Auth::new("q1", "qwen");
        auth.metadata.access_token = Some("tok".to_string());
        auth.metadata
            .extra
            .insert("resource_url".to_string(), serde_json::json!("portal-intl.qwen.ai"));

        let request = ChatRequest {
            model: "qwen3-coder-plus".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..ChatRequest::default()
        };
        let upstream = QwenExecutor
            .build_request(&auth, &request, "qwen3-coder-plus")
            .unwrap();
        assert_eq!(upstream.url, "https://portal-intl.qwen.ai/v1/chat/completions");
    }
}
