//! Credential value types: one auth entry, its per-model state, and the
//! pickability rule every selection path shares.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use polymux_common::{now_epoch_seconds, parse_epoch_value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Active,
    Disabled,
    Error,
    Cooling,
    Unavailable,
}

/// Per-(auth, model) quota snapshot. Epoch seconds; 0 means unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    #[serde(default)]
    pub exceeded: bool,
    #[serde(default)]
    pub next_recover_at: i64,
    #[serde(default)]
    pub exponential_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelState {
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub next_retry_after: i64,
    #[serde(default)]
    pub quota: QuotaState,
}

/// Typed credential payload. Providers use the subset they need; anything
/// else rides in `extra` and round-trips through the auth file untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Hook for providers whose refresh decision cannot be expressed as a plain
/// expiry lead (populated by the registry at load time, never serialized).
pub trait RefreshEvaluator: Send + Sync {
    fn should_refresh(&self, now_epoch: i64, auth: &Auth) -> bool;
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub provider: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub next_retry_after: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub last_refreshed_at: i64,
    #[serde(default)]
    pub next_refresh_after: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub metadata: AuthMetadata,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_states: HashMap<String, ModelState>,
    #[serde(skip)]
    pub runtime: Option<Arc<dyn RefreshEvaluator>>,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("provider", &self.provider)
            .field("status", &self.status)
            .field("disabled", &self.disabled)
            .field("unavailable", &self.unavailable)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    None,
    Disabled,
    Cooldown,
    Other,
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = now_epoch_seconds();
        Self {
            id: id.into(),
            label: String::new(),
            provider: provider.into(),
            file_name: String::new(),
            status: AuthStatus::Active,
            disabled: false,
            unavailable: false,
            next_retry_after: 0,
            created_at: now,
            updated_at: now,
            last_refreshed_at: 0,
            next_refresh_after: 0,
            status_message: None,
            metadata: AuthMetadata::default(),
            attributes: HashMap::new(),
            model_states: HashMap::new(),
            runtime: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled || self.status == AuthStatus::Disabled
    }

    /// Token expiry, consulting the typed field first, then the loose
    /// metadata keys other tooling writes (`expires_at`, `expired`, `expiry`).
    pub fn expiration_epoch(&self) -> Option<i64> {
        if let Some(expiry) = self.metadata.expires_at {
            if expiry > 0 {
                return Some(expiry);
            }
        }
        for key in ["expires_at", "expired", "expiry", "expiry_date"] {
            if let Some(value) = self.metadata.extra.get(key) {
                if let Some(epoch) = parse_epoch_value(value) {
                    return Some(epoch);
                }
            }
        }
        for key in ["expires_at", "expired", "expiry"] {
            if let Some(value) = self.attributes.get(key) {
                if let Some(epoch) = polymux_common::parse_epoch_str(value) {
                    return Some(epoch);
                }
            }
        }
        None
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    pub fn is_runtime_only(&self) -> bool {
        self.attr("runtime_only")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    /// The pickability rule. Returns the block reason and, for cooldowns,
    /// the epoch at which the block lifts.
    pub fn blocked_for_model(&self, model: &str, now_epoch: i64) -> (BlockReason, Option<i64>) {
        if self.is_disabled() {
            return (BlockReason::Disabled, None);
        }
        if self.unavailable && self.next_retry_after > now_epoch {
            return (BlockReason::Cooldown, Some(self.next_retry_after));
        }
        if let Some(state) = self.model_states.get(model) {
            if state.status == AuthStatus::Disabled {
                return (BlockReason::Disabled, None);
            }
            if state.unavailable && state.next_retry_after > now_epoch {
                return (BlockReason::Cooldown, Some(state.next_retry_after));
            }
            if state.quota.exceeded && state.quota.next_recover_at > now_epoch {
                return (BlockReason::Cooldown, Some(state.quota.next_recover_at));
            }
        }
        (BlockReason::None, None)
    }

    pub fn is_pickable(&self, model: &str, now_epoch: i64) -> bool {
        matches!(self.blocked_for_model(model, now_epoch).0, BlockReason::None)
    }

    /// Field-wise merge used by registry upserts: non-empty incoming fields
    /// win, timestamps and runtime state are preserved where absent.
    pub fn merge_from(&mut self, incoming: Auth) {
        if !incoming.label.is_empty() {
            self.label = incoming.label;
        }
        if !incoming.file_name.is_empty() {
            self.file_name = incoming.file_name;
        }
        self.provider = incoming.provider;
        self.disabled = incoming.disabled;
        self.status = incoming.status;
        if incoming.metadata.access_token.is_some()
            || incoming.metadata.refresh_token.is_some()
            || !incoming.metadata.extra.is_empty()
        {
            self.metadata = incoming.metadata;
        }
        if !incoming.attributes.is_empty() {
            self.attributes = incoming.attributes;
        }
        if incoming.last_refreshed_at > 0 {
            self.last_refreshed_at = incoming.last_refreshed_at;
        }
        if incoming.next_refresh_after > 0 {
            self.next_refresh_after = incoming.next_refresh_after;
        }
        if incoming.runtime.is_some() {
            self.runtime = incoming.runtime;
        }
        self.updated_at = now_epoch_seconds();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_flag_and_status_both_block() {
        let now = now_epoch_seconds();
        let mut auth = Auth::new("a", "claude");
        assert_eq!(auth.blocked_for_model("m", now).0, BlockReason::None);

        auth.disabled = true;
        assert_eq!(auth.blocked_for_model("m", now).0, BlockReason::Disabled);

        auth.disabled = false;
        auth.status = AuthStatus::Disabled;
        assert_eq!(auth.blocked_for_model("m", now).0, BlockReason::Disabled);
    }

    #[test]
    fn model_level_cooldown_blocks_only_that_model() {
        let now = now_epoch_seconds();
        let mut auth = Auth::new("a", "gemini");
        auth.model_states.insert(
            "model-a".to_string(),
            ModelState {
                unavailable: true,
                next_retry_after: now + 3600,
                quota: QuotaState {
                    exceeded: true,
                    next_recover_at: now + 3600,
                    exponential_level: 0,
                },
                ..ModelState::default()
            },
        );
        let (reason, until) = auth.blocked_for_model("model-a", now);
        assert_eq!(reason, BlockReason::Cooldown);
        assert_eq!(until, Some(now + 3600));
        assert!(auth.is_pickable("model-b", now));
    }

    #[test]
    fn expired_cooldown_no_longer_blocks() {
        let now = now_epoch_seconds();
        let mut auth = Auth::new("a", "gemini");
        auth.model_states.insert(
            "m".to_string(),
            ModelState {
                unavailable: true,
                next_retry_after: now - 10,
                ..ModelState::default()
            },
        );
        assert!(auth.is_pickable("m", now));
    }

    #[test]
    fn expiration_reads_typed_then_loose_fields() {
        let mut auth = Auth::new("a", "claude");
        assert_eq!(auth.expiration_epoch(), None);

        auth.metadata
            .extra
            .insert("expired".to_string(), serde_json::json!("2023-11-14T22:13:20Z"));
        assert_eq!(auth.expiration_epoch(), Some(1700000000));

        auth.metadata.expires_at = Some(1800000000);
        assert_eq!(auth.expiration_epoch(), Some(1800000000));
    }

    #[test]
    fn auth_file_shape_round_trips() {
        let mut auth = Auth::new("claude-1", "claude");
        auth.label = "work".to_string();
        auth.metadata.access_token = Some("tok".to_string());
        auth.metadata
            .extra
            .insert("custom".to_string(), serde_json::json!("x"));
        auth.attributes
            .insert("runtime_only".to_string(), "true".to_string());

        let text = serde_json::to_string(&auth).unwrap();
        let parsed: Auth = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.id, "claude-1");
        assert_eq!(parsed.metadata.access_token.as_deref(), Some("tok"));
        assert_eq!(parsed.metadata.extra["custom"], "x");
        assert!(parsed.is_runtime_only());
    }
}
