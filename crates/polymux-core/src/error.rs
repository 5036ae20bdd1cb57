//! The closed error taxonomy and upstream-failure classification.

use std::time::{Duration, SystemTime};

use polymux_auth::registry::is_revoked_message;
use polymux_auth::ResultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Unknown,
    UserError,
    AuthError,
    AuthRevoked,
    QuotaError,
    Transient,
    NotFound,
    ClientCanceled,
}

impl ErrorCategory {
    /// Whether the manager should try another credential.
    pub fn should_fallback(&self) -> bool {
        matches!(
            self,
            ErrorCategory::AuthError | ErrorCategory::QuotaError | ErrorCategory::Transient
        )
    }

    /// Whether the failure is the caller's to fix, not the gateway's.
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            ErrorCategory::UserError | ErrorCategory::NotFound | ErrorCategory::ClientCanceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::UserError => "user_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::AuthRevoked => "auth_revoked",
            ErrorCategory::QuotaError => "quota_error",
            ErrorCategory::Transient => "transient",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::ClientCanceled => "client_canceled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: String,
    pub message: String,
    pub http_status: u16,
    pub retry_after: Option<Duration>,
    pub category: ErrorCategory,
}

impl Error {
    pub fn new(
        category: ErrorCategory,
        http_status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status,
            retry_after: None,
            category,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::UserError, 400, "bad_request", message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, 502, "upstream_error", message)
    }

    pub fn canceled() -> Self {
        Self::new(
            ErrorCategory::ClientCanceled,
            499,
            "client_canceled",
            "client canceled the request",
        )
    }

    pub fn all_cooling(model: &str, retry_after: Duration) -> Self {
        Self::new(
            ErrorCategory::QuotaError,
            429,
            "model_cooldown",
            format!(
                "all credentials for {model} are cooling down, retry after {}s",
                retry_after.as_secs()
            ),
        )
        .with_retry_after(retry_after)
    }

    pub fn no_auth(provider: &str) -> Self {
        Self::new(
            ErrorCategory::AuthError,
            503,
            "auth_unavailable",
            format!("no usable credential for provider {provider}"),
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.code,
            self.category.as_str(),
            self.message
        )
    }
}

impl std::error::Error for Error {}

impl From<&Error> for ResultError {
    fn from(err: &Error) -> Self {
        ResultError {
            code: err.code.clone(),
            message: err.message.clone(),
            http_status: err.http_status,
            retry_after: err.retry_after,
        }
    }
}

/// `Retry-After`: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

/// Classify a non-2xx upstream response. The body is scanned for a terse
/// message; sensitive fields are not copied through.
pub fn classify_status(status: u16, retry_after: Option<&str>, body: &[u8]) -> Error {
    let message = extract_message(body);
    match status {
        400 => Error::new(ErrorCategory::UserError, 400, "bad_request", message),
        401 | 403 => {
            let category = if is_revoked_message(&message) {
                ErrorCategory::AuthRevoked
            } else {
                ErrorCategory::AuthError
            };
            let code = if status == 401 { "unauthorized" } else { "forbidden" };
            Error::new(category, status, code, message)
        }
        404 => Error::new(ErrorCategory::NotFound, 404, "not_found", message),
        429 => {
            let mut err = Error::new(ErrorCategory::QuotaError, 429, "rate_limited", message);
            if let Some(retry_after) = retry_after.and_then(parse_retry_after) {
                err = err.with_retry_after(retry_after);
            }
            err
        }
        408 => Error::new(ErrorCategory::Transient, 408, "timeout", message),
        500..=599 => Error::new(ErrorCategory::Transient, status, "server_error", message),
        _ if (400..500).contains(&status) => {
            Error::new(ErrorCategory::UserError, status, "request_rejected", message)
        }
        _ => Error::new(ErrorCategory::Unknown, status, "unexpected_status", message),
    }
}

/// Best-effort error message out of a provider error body. Falls back to a
/// trimmed copy of the raw text.
fn extract_message(body: &[u8]) -> String {
    const MAX_MESSAGE: usize = 512;
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for pointer in ["/error/message", "/message", "/error_description", "/detail"] {
            if let Some(message) = value.pointer(pointer).and_then(|v| v.as_str()) {
                if !message.is_empty() {
                    return truncate(message, MAX_MESSAGE);
                }
            }
        }
        if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
            return truncate(error, MAX_MESSAGE);
        }
    }
    truncate(String::from_utf8_lossy(body).trim(), MAX_MESSAGE)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_table_matches_policy() {
        let cases = [
            (ErrorCategory::Unknown, false),
            (ErrorCategory::UserError, false),
            (ErrorCategory::AuthError, true),
            (ErrorCategory::AuthRevoked, false),
            (ErrorCategory::QuotaError, true),
            (ErrorCategory::Transient, true),
            (ErrorCategory::NotFound, false),
            (ErrorCategory::ClientCanceled, false),
        ];
        for (category, want) in cases {
            assert_eq!(category.should_fallback(), want, "{category:?}");
        }
    }

    #[test]
    fn user_fault_table() {
        assert!(ErrorCategory::UserError.is_user_fault());
        assert!(ErrorCategory::NotFound.is_user_fault());
        assert!(ErrorCategory::ClientCanceled.is_user_fault());
        assert!(!ErrorCategory::QuotaError.is_user_fault());
        assert!(!ErrorCategory::AuthError.is_user_fault());
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);

        let future = SystemTime::now() + Duration::from_secs(120);
        let header = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed.as_secs() > 110 && parsed.as_secs() <= 120);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(400, None, b"{\"error\":{\"message\":\"bad field\"}}").category,
            ErrorCategory::UserError
        );
        assert_eq!(classify_status(404, None, b"").category, ErrorCategory::NotFound);
        assert_eq!(classify_status(500, None, b"").category, ErrorCategory::Transient);
        assert_eq!(classify_status(503, None, b"").category, ErrorCategory::Transient);

        let quota = classify_status(429, Some("10800"), b"");
        assert_eq!(quota.category, ErrorCategory::QuotaError);
        assert_eq!(quota.retry_after, Some(Duration::from_secs(10800)));
    }

    #[test]
    fn revoke_markers_upgrade_to_auth_revoked() {
        let plain = classify_status(401, None, b"{\"error\":{\"message\":\"Unauthorized\"}}");
        assert_eq!(plain.category, ErrorCategory::AuthError);

        let revoked = classify_status(
            403,
            None,
            b"{\"error\":{\"message\":\"OAuth token has been revoked\"}}",
        );
        assert_eq!(revoked.category, ErrorCategory::AuthRevoked);
    }

    #[test]
    fn message_extraction_prefers_structured_fields() {
        let err = classify_status(500, None, b"{\"error\":{\"message\":\"boom\"}}");
        assert_eq!(err.message, "boom");
        let err = classify_status(500, None, b"plain text failure");
        assert_eq!(err.message, "plain text failure");
    }
}
