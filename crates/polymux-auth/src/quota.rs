//! Per-auth quota accounting and the per-provider scoring strategies.
//!
//! Counters use atomics; the cooldown fields sit behind a small mutex.
//! A state is created lazily on first touch and lives for the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use polymux_common::{fnv32a, now_epoch_seconds};

use crate::backoff::next_quota_cooldown;
use crate::entry::Auth;

const ACTIVE_REQUEST_PENALTY: i64 = 1000;
const USAGE_SCALE: i64 = 10_000;
const BASE_DISPERSION: i64 = 1000;

/// Expired token: pushed to the back of every ordering.
const EXPIRED_TOKEN_PENALTY: i64 = 10_000;
/// Token expiring within the refresh lead: mild penalty.
const NEEDS_REFRESH_PENALTY: i64 = 500;
const NEEDS_REFRESH_LEAD_SECS: i64 = 5 * 60;

pub const CLAUDE_DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 3600);

#[derive(Debug, Clone, Copy, Default)]
pub struct RealQuota {
    pub remaining_tokens: i64,
    pub window_reset_at: i64,
    pub fetched_at: i64,
}

#[derive(Debug, Default)]
struct CooldownFields {
    /// Epoch seconds; 0 = no cooldown.
    cooldown_until: i64,
    learned_cooldown: Option<Duration>,
    last_exhausted_at: i64,
    real_quota: Option<RealQuota>,
}

#[derive(Debug, Default)]
pub struct AuthQuotaState {
    active_requests: AtomicI64,
    total_tokens_used: AtomicI64,
    exponential_level: AtomicI32,
    cooldown: Mutex<CooldownFields>,
}

impl AuthQuotaState {
    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn total_tokens_used(&self) -> i64 {
        self.total_tokens_used.load(Ordering::Relaxed)
    }

    pub fn exponential_level(&self) -> i32 {
        self.exponential_level.load(Ordering::Relaxed)
    }

    /// Epoch seconds, 0 when no cooldown is set.
    pub fn cooldown_until(&self) -> i64 {
        self.cooldown.lock().map(|g| g.cooldown_until).unwrap_or(0)
    }

    pub fn in_cooldown(&self, now_epoch: i64) -> bool {
        self.cooldown_until() > now_epoch
    }

    pub fn learned_cooldown(&self) -> Option<Duration> {
        self.cooldown.lock().ok().and_then(|g| g.learned_cooldown)
    }

    pub fn last_exhausted_at(&self) -> i64 {
        self.cooldown.lock().map(|g| g.last_exhausted_at).unwrap_or(0)
    }

    pub fn real_quota(&self) -> Option<RealQuota> {
        self.cooldown.lock().ok().and_then(|g| g.real_quota)
    }

    pub fn set_real_quota(&self, quota: RealQuota) {
        if let Ok(mut guard) = self.cooldown.lock() {
            guard.real_quota = Some(quota);
        }
    }

    fn set_cooldown(&self, until_epoch: i64, learned: Option<Duration>) {
        if let Ok(mut guard) = self.cooldown.lock() {
            guard.cooldown_until = until_epoch;
            if let Some(learned) = learned {
                guard.learned_cooldown = Some(learned);
            }
            guard.last_exhausted_at = now_epoch_seconds();
        }
    }

    fn clear_cooldown(&self) {
        if let Ok(mut guard) = self.cooldown.lock() {
            guard.cooldown_until = 0;
        }
        self.exponential_level.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderQuotaConfig {
    pub provider: &'static str,
    pub sticky_enabled: bool,
    pub estimated_limit: i64,
}

pub fn provider_quota_config(provider: &str) -> ProviderQuotaConfig {
    match provider {
        // Antigravity accounts are plentiful and cheap; rotate every request.
        "antigravity" => ProviderQuotaConfig {
            provider: "antigravity",
            sticky_enabled: false,
            estimated_limit: 1_500_000,
        },
        "claude" => ProviderQuotaConfig {
            provider: "claude",
            sticky_enabled: true,
            estimated_limit: 500_000,
        },
        "copilot" => ProviderQuotaConfig {
            provider: "copilot",
            sticky_enabled: true,
            estimated_limit: 300_000,
        },
        "gemini" => ProviderQuotaConfig {
            provider: "gemini",
            sticky_enabled: true,
            estimated_limit: 1_000_000,
        },
        _ => ProviderQuotaConfig {
            provider: "default",
            sticky_enabled: true,
            estimated_limit: 500_000,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStrategy {
    Claude,
    Copilot,
    Gemini,
    Antigravity,
    Default,
}

impl QuotaStrategy {
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "claude" => QuotaStrategy::Claude,
            "copilot" => QuotaStrategy::Copilot,
            "gemini" => QuotaStrategy::Gemini,
            "antigravity" => QuotaStrategy::Antigravity,
            _ => QuotaStrategy::Default,
        }
    }

    /// Lower scores are preferred. The base term disperses otherwise-equal
    /// auths; usage and in-flight load dominate it by an order of magnitude.
    pub fn score(
        &self,
        auth: Option<&Auth>,
        state: Option<&AuthQuotaState>,
        config: &ProviderQuotaConfig,
    ) -> i64 {
        let base = auth
            .map(|a| i64::from(fnv32a(&a.id)) % BASE_DISPERSION)
            .unwrap_or(0);

        let mut score = base;
        if let Some(state) = state {
            let limit = config.estimated_limit.max(1);
            score += state.total_tokens_used() * USAGE_SCALE / limit;
            score += state.active_requests() * ACTIVE_REQUEST_PENALTY;
        }

        if *self == QuotaStrategy::Antigravity {
            score += token_expiry_penalty(auth);
        }
        score
    }

    pub fn on_quota_hit(&self, state: &AuthQuotaState, explicit: Option<Duration>) {
        if crate::backoff::quota_cooldown_disabled() {
            return;
        }
        let now = now_epoch_seconds();
        if let Some(explicit) = explicit {
            state.set_cooldown(now + explicit.as_secs() as i64, Some(explicit));
            return;
        }
        if let Some(learned) = state.learned_cooldown() {
            state.set_cooldown(now + learned.as_secs() as i64, None);
            return;
        }
        match self {
            QuotaStrategy::Claude => {
                state.set_cooldown(now + CLAUDE_DEFAULT_COOLDOWN.as_secs() as i64, None);
            }
            _ => {
                let (cooldown, level) = next_quota_cooldown(state.exponential_level());
                state.exponential_level.store(level, Ordering::Relaxed);
                if !cooldown.is_zero() {
                    state.set_cooldown(now + cooldown.as_secs() as i64, None);
                }
            }
        }
    }

    /// Success clears the active cooldown; the learned value survives so the
    /// next implicit hit reuses it.
    pub fn on_success(&self, state: &AuthQuotaState) {
        state.clear_cooldown();
    }
}

fn token_expiry_penalty(auth: Option<&Auth>) -> i64 {
    let Some(auth) = auth else {
        return 0;
    };
    let Some(expiry) = auth.expiration_epoch() else {
        return 0;
    };
    let now = now_epoch_seconds();
    if expiry <= now {
        EXPIRED_TOKEN_PENALTY
    } else if expiry - now <= NEEDS_REFRESH_LEAD_SECS {
        NEEDS_REFRESH_PENALTY
    } else {
        0
    }
}

#[derive(Default)]
pub struct QuotaManager {
    states: RwLock<HashMap<String, Arc<AuthQuotaState>>>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily created; never destroyed while the process lives.
    pub fn state(&self, auth_id: &str) -> Arc<AuthQuotaState> {
        if let Ok(guard) = self.states.read() {
            if let Some(state) = guard.get(auth_id) {
                return Arc::clone(state);
            }
        }
        let mut guard = match self.states.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            guard
                .entry(auth_id.to_string())
                .or_insert_with(|| Arc::new(AuthQuotaState::default())),
        )
    }

    /// Peek without creating.
    pub fn get_state(&self, auth_id: &str) -> Option<Arc<AuthQuotaState>> {
        self.states.read().ok()?.get(auth_id).cloned()
    }

    pub fn record_request_start(&self, auth_id: &str) {
        self.state(auth_id)
            .active_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_end(&self, auth_id: &str, provider: &str, tokens: i64, failed: bool) {
        let state = self.state(auth_id);
        let previous = state.active_requests.fetch_sub(1, Ordering::Relaxed);
        if previous <= 0 {
            // A request-end without a matching start would drive the counter
            // negative; clamp and keep going.
            state.active_requests.store(0, Ordering::Relaxed);
        }
        if tokens > 0 {
            state.total_tokens_used.fetch_add(tokens, Ordering::Relaxed);
        }
        if !failed {
            QuotaStrategy::for_provider(provider).on_success(&state);
        }
    }

    pub fn record_quota_hit(
        &self,
        auth_id: &str,
        provider: &str,
        model: &str,
        reset_after: Option<Duration>,
    ) {
        let state = self.state(auth_id);
        let strategy = QuotaStrategy::for_provider(provider);
        strategy.on_quota_hit(&state, reset_after);
        debug!(
            auth_id,
            provider,
            model,
            cooldown_until = state.cooldown_until(),
            "quota hit recorded"
        );
    }

    pub fn score(&self, auth: &Auth, config: &ProviderQuotaConfig) -> i64 {
        let strategy = QuotaStrategy::for_provider(&auth.provider);
        let state = self.get_state(&auth.id);
        strategy.score(Some(auth), state.as_deref(), config)
    }

    /// Remaining cooldown for an auth, if any.
    pub fn cooldown_remaining(&self, auth_id: &str, now_epoch: i64) -> Option<Duration> {
        let state = self.get_state(auth_id)?;
        let until = state.cooldown_until();
        if until > now_epoch {
            Some(Duration::from_secs((until - now_epoch) as u64))
        } else {
            None
        }
    }

    /// Drop states idle since before `cutoff_epoch`. Optional housekeeping;
    /// counters for live auths are never trimmed.
    pub fn cleanup_stale(&self, cutoff_epoch: i64) -> usize {
        let Ok(mut guard) = self.states.write() else {
            return 0;
        };
        let before = guard.len();
        guard.retain(|_, state| {
            state.active_requests() > 0
                || state.cooldown_until() > cutoff_epoch
                || state.last_exhausted_at() >= cutoff_epoch
                || state.total_tokens_used() > 0
        });
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(tokens: i64, active: i64) -> AuthQuotaState {
        let state = AuthQuotaState::default();
        state.total_tokens_used.store(tokens, Ordering::Relaxed);
        state.active_requests.store(active, Ordering::Relaxed);
        state
    }

    fn test_config() -> ProviderQuotaConfig {
        ProviderQuotaConfig {
            provider: "test",
            sticky_enabled: true,
            estimated_limit: 500_000,
        }
    }

    #[test]
    fn score_orders_by_usage() {
        let strategy = QuotaStrategy::Default;
        let config = test_config();

        let base = strategy.score(None, Some(&test_state(200_000, 0)), &config);
        assert!(strategy.score(None, None, &config) < base);
        assert!(strategy.score(None, Some(&test_state(100_000, 0)), &config) < base);
        assert!(strategy.score(None, Some(&test_state(400_000, 0)), &config) > base);
    }

    #[test]
    fn score_penalizes_active_requests() {
        let strategy = QuotaStrategy::Default;
        let config = test_config();

        let idle = strategy.score(None, Some(&test_state(100_000, 0)), &config);
        let busy = strategy.score(None, Some(&test_state(100_000, 3)), &config);
        assert!(busy > idle);
        assert!(busy - idle >= 3 * ACTIVE_REQUEST_PENALTY);
    }

    #[test]
    fn antigravity_penalizes_expiring_tokens() {
        let strategy = QuotaStrategy::Antigravity;
        let now = now_epoch_seconds();

        let mut ready = Auth::new("ready", "antigravity");
        ready.metadata.expires_at = Some(now + 3600);
        let mut expiring = Auth::new("expiring", "antigravity");
        expiring.metadata.expires_at = Some(now + 3 * 60);
        let mut expired = Auth::new("expired", "antigravity");
        expired.metadata.expires_at = Some(now - 3600);

        let state = AuthQuotaState::default();
        let config = provider_quota_config("antigravity");
        let ready_score = strategy.score(Some(&ready), Some(&state), &config);
        let expiring_score = strategy.score(Some(&expiring), Some(&state), &config);
        let expired_score = strategy.score(Some(&expired), Some(&state), &config);

        assert!(expiring_score > ready_score);
        assert!(expired_score > expiring_score);
        assert!(expired_score - ready_score >= EXPIRED_TOKEN_PENALTY - BASE_DISPERSION);
        assert!(expiring_score - ready_score >= NEEDS_REFRESH_PENALTY - BASE_DISPERSION);
    }

    #[test]
    fn request_start_end_pair_balances() {
        let manager = QuotaManager::new();
        manager.record_request_start("auth1");
        assert_eq!(manager.state("auth1").active_requests(), 1);

        manager.record_request_end("auth1", "antigravity", 1000, false);
        let state = manager.state("auth1");
        assert_eq!(state.active_requests(), 0);
        assert_eq!(state.total_tokens_used(), 1000);
    }

    #[test]
    fn quota_hit_sets_cooldown_and_success_clears_it() {
        let manager = QuotaManager::new();
        let now = now_epoch_seconds();
        manager.record_quota_hit("auth1", "antigravity", "m", Some(Duration::from_secs(1800)));

        let state = manager.state("auth1");
        assert!(state.cooldown_until() >= now + 1799);
        assert_eq!(state.learned_cooldown(), Some(Duration::from_secs(1800)));

        manager.record_request_start("auth1");
        manager.record_request_end("auth1", "antigravity", 100, false);
        assert_eq!(state.cooldown_until(), 0);
        // Learned value survives the clear.
        assert_eq!(state.learned_cooldown(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn failed_request_keeps_cooldown() {
        let manager = QuotaManager::new();
        manager.record_quota_hit("auth1", "claude", "m", Some(Duration::from_secs(600)));
        manager.record_request_start("auth1");
        manager.record_request_end("auth1", "claude", 0, true);
        assert!(manager.state("auth1").cooldown_until() > 0);
    }

    #[test]
    fn claude_default_cooldown_is_five_hours() {
        let strategy = QuotaStrategy::Claude;
        let state = AuthQuotaState::default();
        let now = now_epoch_seconds();
        strategy.on_quota_hit(&state, None);

        let actual = state.cooldown_until() - now;
        assert!(
            (actual - 5 * 3600).abs() <= 1,
            "expected ~5h cooldown, got {actual}s"
        );
    }

    #[test]
    fn claude_explicit_cooldown_overrides_default() {
        let strategy = QuotaStrategy::Claude;
        let state = AuthQuotaState::default();
        let now = now_epoch_seconds();
        strategy.on_quota_hit(&state, Some(Duration::from_secs(1800)));

        let actual = state.cooldown_until() - now;
        assert!((actual - 1800).abs() <= 1, "expected ~30m, got {actual}s");
    }

    #[test]
    fn claude_learned_cooldown_reused_on_implicit_hit() {
        let strategy = QuotaStrategy::Claude;
        let state = AuthQuotaState::default();
        strategy.on_quota_hit(&state, Some(Duration::from_secs(2 * 3600)));
        assert_eq!(state.learned_cooldown(), Some(Duration::from_secs(7200)));

        state.set_cooldown(0, None);
        if let Ok(mut guard) = state.cooldown.lock() {
            guard.cooldown_until = 0;
        }

        let now = now_epoch_seconds();
        strategy.on_quota_hit(&state, None);
        let actual = state.cooldown_until() - now;
        assert!(
            (actual - 7200).abs() <= 1,
            "expected learned 2h, got {actual}s"
        );
    }

    #[test]
    fn default_strategy_backs_off_exponentially() {
        let strategy = QuotaStrategy::Gemini;
        let state = AuthQuotaState::default();
        let now = now_epoch_seconds();

        strategy.on_quota_hit(&state, None);
        assert!((state.cooldown_until() - now - 1).abs() <= 1);
        assert_eq!(state.exponential_level(), 1);

        if let Ok(mut guard) = state.cooldown.lock() {
            guard.cooldown_until = 0;
        }
        strategy.on_quota_hit(&state, None);
        assert!((state.cooldown_until() - now - 2).abs() <= 2);
        assert_eq!(state.exponential_level(), 2);

        // Success resets the level.
        strategy.on_success(&state);
        assert_eq!(state.exponential_level(), 0);
    }

    #[test]
    fn provider_config_sticky_flags() {
        assert!(!provider_quota_config("antigravity").sticky_enabled);
        assert!(provider_quota_config("claude").sticky_enabled);
        assert!(provider_quota_config("copilot").sticky_enabled);
        assert!(provider_quota_config("gemini").sticky_enabled);
        assert!(provider_quota_config("unknown").sticky_enabled);
    }

    #[test]
    fn strategy_factory_maps_providers() {
        assert_eq!(QuotaStrategy::for_provider("antigravity"), QuotaStrategy::Antigravity);
        assert_eq!(QuotaStrategy::for_provider("claude"), QuotaStrategy::Claude);
        assert_eq!(QuotaStrategy::for_provider("copilot"), QuotaStrategy::Copilot);
        assert_eq!(QuotaStrategy::for_provider("gemini"), QuotaStrategy::Gemini);
        assert_eq!(QuotaStrategy::for_provider("whatever"), QuotaStrategy::Default);
    }

    #[test]
    fn matched_start_end_pairs_leave_zero_active() {
        let manager = QuotaManager::new();
        for _ in 0..50 {
            manager.record_request_start("a");
        }
        for _ in 0..50 {
            manager.record_request_end("a", "claude", 10, false);
        }
        assert_eq!(manager.state("a").active_requests(), 0);
    }
}
