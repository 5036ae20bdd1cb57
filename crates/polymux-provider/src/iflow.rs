//! iFlow executor (OpenAI dialect).

use std::time::Duration;

use async_trait::async_trait;

use polymux_auth::{Auth, RefreshError};
use polymux_protocol::{ChatRequest, Dialect};

use crate::oauth;
use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const API_BASE: &str = "https://apis.iflow.cn/v1";
const TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const CLIENT_ID: &str = "10009311001";
const IFLOW_UA: &str = "iflow-cli/0.3.1";

const REFRESH_LEAD: Duration = Duration::from_secs(10 * 60);

pub struct IflowExecutor;

#[async_trait]
impl ProviderExecutor for IflowExecutor {
    fn name(&self) -> &'static str {
        "iflow"
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
        // iFlow hands out a separate API key next to the OAuth tokens.
        let api_key = auth
            .metadata
            .extra
            .get("api_key")
            .and_then(|v| v.as_str())
            .or(auth.metadata.access_token.as_deref())
            .filter(|key| !key.trim().is_empty())
            .ok_or(ExecutorError::MissingCredentialField("api_key"))?;

        let mut upstream = request.clone();
        upstream.model = model_id.to_string();
        let body = polymux_protocol::ir_to_request(Dialect::OpenAi, &upstream);

        let mut headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {api_key}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "User-Agent", IFLOW_UA);

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
        let client_secret = auth.metadata.client_secret.as_deref();
        let body = oauth::refresh_form_body(CLIENT_ID, client_secret, refresh_token);
        let tokens = oauth::post_refresh(
            client,
            TOKEN_URL,
            "application/x-www-form-urlencoded",
            body,
            IFLOW_UA,
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
    use crate::header_get;
    use polymux_protocol::{Message, Role};

    #[test]
    fn api_key_preferred_over_access_token() {
        let mut auth = Auth::new("i1", "iflow");
        auth.metadata.access_token = Some("oauth-token".to_string());
        auth.metadata
            .extra
            .insert("api_key".to_string(), serde_json::json!("sk-iflow-1"));

        let request = ChatRequest {
            model: "qwen3-max".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..ChatRequest::default()
        };
        let upstream = IflowExecutor
            .build_request(&auth, &request, "qwen3-max")
            .unwrap();
        assert_eq!(
            header_get(&upstream.headers, "authorization"),
            Some("Bearer sk-iflow-1")
        );
    }
}
