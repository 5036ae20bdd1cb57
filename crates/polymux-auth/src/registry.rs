//! The authoritative credential set: upserts, atomic updates, result
//! marking (the circuit breaker), change events, and disk persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use polymux_common::now_epoch_seconds;

use crate::entry::{Auth, AuthStatus, ModelState, RefreshEvaluator};
use crate::quota::QuotaManager;
use crate::store::AuthStore;

const CHANGE_BUFFER: usize = 64;

/// Upstream messages that mean the credential is permanently dead.
const REVOKED_MARKERS: &[&str] = &[
    "token has been revoked",
    "token revoked",
    "invalid_grant",
    "refresh token is invalid",
    "api key has been revoked",
    "account has been disabled",
    "account is deactivated",
    "subscription expired",
];

pub fn is_revoked_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    REVOKED_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub struct ResultError {
    pub code: String,
    pub message: String,
    pub http_status: u16,
    pub retry_after: Option<Duration>,
}

/// Outcome of one upstream attempt, reported by the manager.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub error: Option<ResultError>,
}

#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Created(Auth),
    Updated(Auth),
    Deleted(String),
}

pub struct AuthRegistry {
    auths: RwLock<HashMap<String, Auth>>,
    evaluators: RwLock<HashMap<String, Arc<dyn RefreshEvaluator>>>,
    store: Option<AuthStore>,
    quota: Arc<QuotaManager>,
    events: broadcast::Sender<ChangeEvent>,
}

impl AuthRegistry {
    pub fn new(store: Option<AuthStore>, quota: Arc<QuotaManager>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            auths: RwLock::new(HashMap::new()),
            evaluators: RwLock::new(HashMap::new()),
            store,
            quota,
            events,
        }
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Provider-type evaluator table; attached to entries on register.
    pub fn set_evaluator(&self, provider: &str, evaluator: Arc<dyn RefreshEvaluator>) {
        if let Ok(mut guard) = self.evaluators.write() {
            guard.insert(provider.to_string(), evaluator);
        }
    }

    /// Load the auth directory into memory. Persistence errors surface as
    /// entry status, never as a hard failure.
    pub fn load_from_store(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.load_all() {
            Ok(auths) => {
                let count = auths.len();
                for auth in auths {
                    self.register(auth);
                }
                count
            }
            Err(err) => {
                warn!(error = %err, "auth directory load failed");
                0
            }
        }
    }

    /// Upsert by ID. Existing entries merge non-empty incoming fields.
    pub fn register(&self, mut auth: Auth) -> (Auth, bool) {
        if auth.runtime.is_none() {
            if let Ok(guard) = self.evaluators.read() {
                if let Some(evaluator) = guard.get(&auth.provider) {
                    auth.runtime = Some(Arc::clone(evaluator));
                }
            }
        }
        if auth.file_name.is_empty() {
            auth.file_name = AuthStore::file_name_for(&auth);
        }

        let (snapshot, created) = {
            let mut guard = write_lock(&self.auths);
            match guard.get_mut(&auth.id) {
                Some(existing) => {
                    existing.merge_from(auth);
                    (existing.clone(), false)
                }
                None => {
                    let snapshot = auth.clone();
                    guard.insert(auth.id.clone(), auth);
                    (snapshot, true)
                }
            }
        };

        self.persist(&snapshot);
        let event = if created {
            ChangeEvent::Created(snapshot.clone())
        } else {
            ChangeEvent::Updated(snapshot.clone())
        };
        let _ = self.events.send(event);
        (snapshot, created)
    }

    /// Atomic read-modify-write; returns the updated snapshot.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Auth)) -> Option<Auth> {
        let snapshot = {
            let mut guard = write_lock(&self.auths);
            let auth = guard.get_mut(id)?;
            mutate(auth);
            auth.updated_at = now_epoch_seconds();
            auth.clone()
        };
        self.persist(&snapshot);
        let _ = self.events.send(ChangeEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = {
            let mut guard = write_lock(&self.auths);
            guard.remove(id)
        };
        let Some(auth) = removed else {
            return false;
        };
        if let Some(store) = &self.store {
            if let Err(err) = store.delete(&auth.file_name) {
                warn!(auth_id = %auth.id, error = %err, "auth file delete failed");
            }
        }
        let _ = self.events.send(ChangeEvent::Deleted(auth.id));
        true
    }

    pub fn get(&self, id: &str) -> Option<Auth> {
        self.auths.read().ok()?.get(id).cloned()
    }

    /// Clones; callers may hold them across awaits safely.
    pub fn list(&self) -> Vec<Auth> {
        match self.auths.read() {
            Ok(guard) => {
                let mut auths: Vec<Auth> = guard.values().cloned().collect();
                auths.sort_by(|a, b| a.id.cmp(&b.id));
                auths
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn list_provider(&self, provider: &str) -> Vec<Auth> {
        self.list()
            .into_iter()
            .filter(|auth| auth.provider == provider)
            .collect()
    }

    /// Providers with at least one registered entry.
    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self
            .list()
            .into_iter()
            .map(|auth| auth.provider)
            .collect();
        providers.sort();
        providers.dedup();
        providers
    }

    /// The circuit breaker: apply an attempt outcome to auth state.
    ///
    /// 401/403 kill the credential (hard revoke, pending re-login); 429
    /// cools it through the quota strategy and the per-model state; success
    /// reactivates a previously cooling entry.
    pub fn mark_result(&self, result: AuthResult) {
        if result.success {
            self.update(&result.auth_id, |auth| {
                auth.unavailable = false;
                auth.next_retry_after = 0;
                if !auth.disabled && auth.status != AuthStatus::Disabled {
                    auth.status = AuthStatus::Active;
                    auth.status_message = None;
                }
                if let Some(state) = auth.model_states.get_mut(&result.model) {
                    state.unavailable = false;
                    state.next_retry_after = 0;
                    state.quota.exceeded = false;
                    state.quota.next_recover_at = 0;
                    state.quota.exponential_level = 0;
                }
            });
            return;
        }

        let Some(error) = result.error else {
            return;
        };

        match error.http_status {
            401 | 403 => {
                info!(
                    auth_id = %result.auth_id,
                    status = error.http_status,
                    message = %error.message,
                    "credential rejected by upstream, disabling"
                );
                self.update(&result.auth_id, |auth| {
                    auth.disabled = true;
                    auth.status = AuthStatus::Disabled;
                    auth.status_message = Some(error.message.clone());
                });
            }
            429 => {
                self.quota.record_quota_hit(
                    &result.auth_id,
                    &result.provider,
                    &result.model,
                    error.retry_after,
                );
                let recover_at = self
                    .quota
                    .get_state(&result.auth_id)
                    .map(|state| state.cooldown_until())
                    .unwrap_or(0);
                self.update(&result.auth_id, |auth| {
                    auth.status = AuthStatus::Cooling;
                    let state = auth
                        .model_states
                        .entry(result.model.clone())
                        .or_insert_with(ModelState::default);
                    state.unavailable = recover_at > 0;
                    state.next_retry_after = recover_at;
                    state.quota.exceeded = recover_at > 0;
                    state.quota.next_recover_at = recover_at;
                });
            }
            _ => {
                // Transient failures leave the entry pickable; the retry
                // loop and quota counters handle pacing.
            }
        }
    }

    fn persist(&self, auth: &Auth) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(auth) {
            warn!(auth_id = %auth.id, error = %err, "auth persistence failed");
            let mut guard = write_lock(&self.auths);
            if let Some(entry) = guard.get_mut(&auth.id) {
                entry.status = AuthStatus::Error;
                entry.status_message = Some(format!("persist: {err}"));
            }
        }
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AuthRegistry {
        AuthRegistry::new(None, Arc::new(QuotaManager::new()))
    }

    fn result_with_status(auth_id: &str, status: u16, message: &str) -> AuthResult {
        AuthResult {
            auth_id: auth_id.to_string(),
            provider: "claude".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            success: false,
            error: Some(ResultError {
                code: String::new(),
                message: message.to_string(),
                http_status: status,
                retry_after: None,
            }),
        }
    }

    #[test]
    fn register_is_upsert_by_id() {
        let reg = registry();
        let (_, created) = reg.register(Auth::new("a1", "claude"));
        assert!(created);

        let mut updated = Auth::new("a1", "claude");
        updated.label = "new label".to_string();
        let (snapshot, created) = reg.register(updated);
        assert!(!created);
        assert_eq!(snapshot.label, "new label");
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn unauthorized_disables_the_credential() {
        let reg = registry();
        reg.register(Auth::new("cb-401", "claude"));
        reg.mark_result(result_with_status("cb-401", 401, "Unauthorized"));

        let auth = reg.get("cb-401").unwrap();
        assert!(auth.disabled);
        assert_eq!(auth.status, AuthStatus::Disabled);
    }

    #[test]
    fn forbidden_disables_the_credential() {
        let reg = registry();
        reg.register(Auth::new("cb-403", "claude"));
        reg.mark_result(result_with_status(
            "cb-403",
            403,
            "Forbidden - subscription expired",
        ));

        let auth = reg.get("cb-403").unwrap();
        assert!(auth.disabled);
        assert_eq!(auth.status, AuthStatus::Disabled);
    }

    #[test]
    fn revoked_oauth_message_disables() {
        let reg = registry();
        reg.register(Auth::new("cb-revoked", "claude"));
        reg.mark_result(result_with_status(
            "cb-revoked",
            403,
            "OAuth token has been revoked. Please obtain a new token.",
        ));
        assert!(reg.get("cb-revoked").unwrap().disabled);
        assert!(is_revoked_message("OAuth token has been REVOKED"));
        assert!(!is_revoked_message("rate limit exceeded"));
    }

    #[test]
    fn rate_limit_cools_but_never_disables() {
        let reg = registry();
        reg.register(Auth::new("cb-429", "claude"));
        let mut result = result_with_status("cb-429", 429, "Rate limit exceeded");
        result.error.as_mut().unwrap().retry_after = Some(Duration::from_secs(3 * 3600));
        reg.mark_result(result);

        let auth = reg.get("cb-429").unwrap();
        assert!(!auth.disabled);
        assert_ne!(auth.status, AuthStatus::Disabled);
        assert_eq!(auth.status, AuthStatus::Cooling);

        let now = now_epoch_seconds();
        let state = auth.model_states.get("claude-sonnet-4-5").unwrap();
        assert!(state.quota.exceeded);
        assert!(state.quota.next_recover_at >= now + 3 * 3600 - 1);
        assert!(!auth.is_pickable("claude-sonnet-4-5", now));

        let quota_state = reg.quota().get_state("cb-429").unwrap();
        assert!(quota_state.cooldown_until() >= now + 3 * 3600 - 1);
    }

    #[test]
    fn server_error_does_not_disable() {
        let reg = registry();
        reg.register(Auth::new("cb-500", "claude"));
        reg.mark_result(result_with_status("cb-500", 500, "Internal server error"));
        let auth = reg.get("cb-500").unwrap();
        assert!(!auth.disabled);
        assert!(auth.is_pickable("claude-sonnet-4-5", now_epoch_seconds()));
    }

    #[test]
    fn success_reactivates_cooling_entry() {
        let reg = registry();
        reg.register(Auth::new("ok", "claude"));
        let mut result = result_with_status("ok", 429, "rate limited");
        result.error.as_mut().unwrap().retry_after = Some(Duration::from_secs(60));
        reg.mark_result(result);
        assert_eq!(reg.get("ok").unwrap().status, AuthStatus::Cooling);

        reg.mark_result(AuthResult {
            auth_id: "ok".to_string(),
            provider: "claude".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            success: true,
            error: None,
        });
        let auth = reg.get("ok").unwrap();
        assert_eq!(auth.status, AuthStatus::Active);
        assert!(auth.is_pickable("claude-sonnet-4-5", now_epoch_seconds()));
    }

    #[test]
    fn success_does_not_reenable_disabled_entry() {
        let reg = registry();
        reg.register(Auth::new("dead", "claude"));
        reg.mark_result(result_with_status("dead", 401, "Unauthorized"));
        reg.mark_result(AuthResult {
            auth_id: "dead".to_string(),
            provider: "claude".to_string(),
            model: "m".to_string(),
            success: true,
            error: None,
        });
        assert!(reg.get("dead").unwrap().disabled);
    }

    #[test]
    fn watch_sees_create_update_delete() {
        let reg = registry();
        let mut rx = reg.watch();
        reg.register(Auth::new("w1", "gemini"));
        reg.update("w1", |auth| auth.label = "x".to_string());
        reg.delete("w1");

        assert!(matches!(rx.try_recv().unwrap(), ChangeEvent::Created(_)));
        assert!(matches!(rx.try_recv().unwrap(), ChangeEvent::Updated(_)));
        assert!(matches!(rx.try_recv().unwrap(), ChangeEvent::Deleted(_)));
    }

    #[test]
    fn update_returns_snapshot() {
        let reg = registry();
        reg.register(Auth::new("u1", "codex"));
        let snapshot = reg
            .update("u1", |auth| {
                auth.metadata.access_token = Some("fresh".to_string());
                auth.last_refreshed_at = now_epoch_seconds();
            })
            .unwrap();
        assert_eq!(snapshot.metadata.access_token.as_deref(), Some("fresh"));
        assert!(reg.update("missing", |_| {}).is_none());
    }

    #[test]
    fn evaluator_attached_by_provider_table() {
        struct Always;
        impl RefreshEvaluator for Always {
            fn should_refresh(&self, _now: i64, _auth: &Auth) -> bool {
                true
            }
        }
        let reg = registry();
        reg.set_evaluator("qwen", Arc::new(Always));
        let (snapshot, _) = reg.register(Auth::new("q1", "qwen"));
        assert!(snapshot.runtime.is_some());
        let (snapshot, _) = reg.register(Auth::new("c1", "claude"));
        assert!(snapshot.runtime.is_none());
    }
}
