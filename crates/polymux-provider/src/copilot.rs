//! GitHub Copilot executor.
//!
//! Copilot layers a short-lived chat token on top of the long-lived GitHub
//! OAuth token. "Refresh" here exchanges the GitHub token for a fresh chat
//! token; the GitHub token itself never rotates through this path.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use polymux_auth::{Auth, RefreshError};
use polymux_common::now_epoch_seconds;
use polymux_protocol::{ChatRequest, Dialect};

use crate::{header_set, ExecutorError, ExecutorResult, ProviderExecutor, UpstreamRequest};

const CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";
const TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const EDITOR_VERSION: &str = "vscode/1.96.2";
const EDITOR_PLUGIN: &str = "copilot-chat/0.23.2";
const COPILOT_UA: &str = "GitHubCopilotChat/0.23.2";

/// Chat tokens live ~30 min.
const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

pub struct CopilotExecutor;

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    token: String,
    #[serde(default)]
    expires_at: i64,
}

#[async_trait]
impl ProviderExecutor for CopilotExecutor {
    fn name(&self) -> &'static str {
        "copilot"
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
        let chat_token = auth
            .metadata
            .access_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ExecutorError::MissingCredentialField("access_token"))?;

        let mut upstream = request.clone();
        upstream.model = model_id.to_string();
        let body = polymux_protocol::ir_to_request(Dialect::OpenAi, &upstream);

        let mut headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {chat_token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "User-Agent", COPILOT_UA);
        header_set(&mut headers, "Editor-Version", EDITOR_VERSION);
        header_set(&mut headers, "Editor-Plugin-Version", EDITOR_PLUGIN);
        header_set(&mut headers, "Copilot-Integration-Id", "vscode-chat");
        header_set(&mut headers, "Openai-Intent", "conversation-panel");

        Ok(UpstreamRequest {
            url: CHAT_URL.to_string(),
            headers,
            body: serde_json::to_vec(&body)
                .map_err(|err| ExecutorError::Other(err.to_string()))?,
            dialect: Dialect::OpenAi,
            is_stream: request.stream,
        })
    }

    async fn refresh(&self, auth: &Auth, client: &wreq::Client) -> Result<Auth, RefreshError> {
        // The GitHub OAuth token rides in refresh_token; the chat token in
        // access_token.
        let github_token = auth
            .metadata
            .refresh_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| RefreshError::network("missing github token".to_string()))?;

        let response = client
            .get(TOKEN_URL)
            .header("Authorization", format!("token {github_token}"))
            .header("Accept", "application/json")
            .header("User-Agent", COPILOT_UA)
            .header("Editor-Version", EDITOR_VERSION)
            .header("Editor-Plugin-Version", EDITOR_PLUGIN)
            .send()
            .await
            .map_err(|err| RefreshError::network(err.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RefreshError::network(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(RefreshError::http(
                status,
                String::from_utf8_lossy(&bytes).to_string(),
            ));
        }
        let token: CopilotTokenResponse =
            serde_json::from_slice(&bytes).map_err(|err| RefreshError::network(err.to_string()))?;

        let mut updated = auth.clone();
        updated.metadata.access_token = Some(token.token);
        updated.metadata.expires_at = if token.expires_at > 0 {
            Some(token.expires_at)
        } else {
            Some(now_epoch_seconds() + 25 * 60)
        };
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_get;
    use polymux_protocol::{Message, Role};

    #[test]
    fn presents_editor_identity() {
        let mut auth = Auth::new("gh1", "copilot");
        auth.metadata.access_token = Some("chat-token".to_string());
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::text(Role::User, "hello")],
            stream: true,
            ..ChatRequest::default()
        };
        let upstream = CopilotExecutor
            .build_request(&auth, &request, "gpt-4o")
            .unwrap();
        assert_eq!(upstream.url, CHAT_URL);
        assert_eq!(header_get(&upstream.headers, "editor-version"), Some(EDITOR_VERSION));
        assert_eq!(
            header_get(&upstream.headers, "copilot-integration-id"),
            Some("vscode-chat")
        );
        assert!(upstream.is_stream);
    }
}
