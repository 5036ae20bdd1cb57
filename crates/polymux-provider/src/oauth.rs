//! Shared OAuth refresh plumbing (RFC 6749 refresh_token grant).

use serde::Deserialize;

use polymux_auth::{Auth, RefreshError};
use polymux_common::now_epoch_seconds;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_in.map(|secs| now_epoch_seconds() + secs)
    }
}

/// POST a refresh body and decode the token response. Non-2xx surfaces the
/// status so permanent failures (400/401) can disable the credential.
pub async fn post_refresh(
    client: &wreq::Client,
    url: &str,
    content_type: &str,
    body: Vec<u8>,
    user_agent: &str,
) -> Result<TokenResponse, RefreshError> {
    let response = client
        .post(url)
        .header("Content-Type", content_type)
        .header("Accept", "application/json")
        .header("User-Agent", user_agent)
        .body(body)
        .send()
        .await
        .map_err(|err| RefreshError::network(err.to_string()))?;

    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| RefreshError::network(err.to_string()))?;
    if !(200..300).contains(&status) {
        let text = String::from_utf8_lossy(&bytes).to_string();
        return Err(RefreshError::http(status, text));
    }
    serde_json::from_slice(&bytes).map_err(|err| RefreshError::network(err.to_string()))
}

/// `grant_type=refresh_token` form body.
pub fn refresh_form_body(
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> Vec<u8> {
    let mut body = format!(
        "grant_type=refresh_token&client_id={}&refresh_token={}",
        urlencoding::encode(client_id),
        urlencoding::encode(refresh_token),
    );
    if let Some(secret) = client_secret {
        body.push_str("&client_secret=");
        body.push_str(&urlencoding::encode(secret));
    }
    body.into_bytes()
}

/// Same grant as a JSON body, for endpoints that want it.
pub fn refresh_json_body(client_id: &str, refresh_token: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "grant_type": "refresh_token",
        "client_id": client_id,
        "refresh_token": refresh_token,
    }))
    .unwrap_or_default()
}

/// Fold a token response back into the auth metadata. The old refresh token
/// is kept when the endpoint does not rotate it.
pub fn apply_tokens(auth: &Auth, tokens: &TokenResponse) -> Auth {
    let mut updated = auth.clone();
    if !tokens.access_token.is_empty() {
        updated.metadata.access_token = Some(tokens.access_token.clone());
    }
    if let Some(refresh_token) = &tokens.refresh_token {
        if !refresh_token.is_empty() {
            updated.metadata.refresh_token = Some(refresh_token.clone());
        }
    }
    if let Some(id_token) = &tokens.id_token {
        if !id_token.is_empty() {
            updated.metadata.id_token = Some(id_token.clone());
        }
    }
    if let Some(expires_at) = tokens.expires_at() {
        updated.metadata.expires_at = Some(expires_at);
    }
    updated
}

pub fn require_refresh_token(auth: &Auth) -> Result<&str, RefreshError> {
    auth.metadata
        .refresh_token
        .as_deref()
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| RefreshError::network("missing refresh_token".to_string()))
}
