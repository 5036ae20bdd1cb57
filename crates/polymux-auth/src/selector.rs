//! Auth selection: pickability filter, sticky affinity, strategy scoring,
//! and round-robin rotation inside equal-score bands.
//!
//! The selector only reads quota state; every mutation goes through the
//! quota manager or the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use polymux_common::now_epoch_seconds;

use crate::entry::{Auth, BlockReason};
use crate::quota::{provider_quota_config, QuotaManager};
use crate::sticky::StickyStore;

/// Scores within one band of each other count as tied; the band matches the
/// dispersion term so identically-loaded auths rotate instead of pinning.
const SCORE_TIE_BAND: i64 = 1000;

#[derive(Debug, Clone, Default)]
pub struct PickOptions {
    pub force_rotate: bool,
    /// Opaque client affinity key (IP, API-key hash, session token).
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub enum PickError {
    /// No candidate exists for the provider at all.
    AuthNotFound,
    /// Every candidate is cooling down; retry after the shortest wait.
    AllCooling { model: String, retry_after: Duration },
    /// Every candidate is disabled or revoked; retrying will not help.
    AllBlocked { provider: String },
}

impl std::fmt::Display for PickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PickError::AuthNotFound => write!(f, "auth_not_found"),
            PickError::AllCooling { model, retry_after } => write!(
                f,
                "all auths cooling for model {model}, retry after {}s",
                retry_after.as_secs()
            ),
            PickError::AllBlocked { provider } => {
                write!(f, "no usable auth for provider {provider}")
            }
        }
    }
}

impl std::error::Error for PickError {}

pub struct Selector {
    sticky: Arc<StickyStore>,
    quota: Arc<QuotaManager>,
    rotation: Mutex<HashMap<(String, String), usize>>,
}

impl Selector {
    pub fn new(sticky: Arc<StickyStore>, quota: Arc<QuotaManager>) -> Self {
        Self {
            sticky,
            quota,
            rotation: Mutex::new(HashMap::new()),
        }
    }

    pub fn sticky(&self) -> &Arc<StickyStore> {
        &self.sticky
    }

    pub fn pick(
        &self,
        provider: &str,
        model: &str,
        options: &PickOptions,
        candidates: &[Auth],
    ) -> Result<Auth, PickError> {
        if candidates.is_empty() {
            return Err(PickError::AuthNotFound);
        }
        let now = now_epoch_seconds();
        let config = provider_quota_config(provider);

        let mut pickable: Vec<&Auth> = Vec::with_capacity(candidates.len());
        let mut saw_cooldown = false;
        let mut min_retry_at: Option<i64> = None;
        for auth in candidates {
            let (reason, retry_at) = auth.blocked_for_model(model, now);
            match reason {
                BlockReason::None => {}
                BlockReason::Cooldown => {
                    saw_cooldown = true;
                    if let Some(at) = retry_at {
                        min_retry_at = Some(min_retry_at.map_or(at, |cur| cur.min(at)));
                    }
                    continue;
                }
                _ => continue,
            }
            // Auth-level quota cooldown is owned by the quota manager.
            if let Some(state) = self.quota.get_state(&auth.id) {
                let until = state.cooldown_until();
                if until > now {
                    saw_cooldown = true;
                    min_retry_at = Some(min_retry_at.map_or(until, |cur| cur.min(until)));
                    continue;
                }
            }
            pickable.push(auth);
        }

        if pickable.is_empty() {
            if saw_cooldown {
                let wait = min_retry_at
                    .map(|at| Duration::from_secs((at - now).max(1) as u64))
                    .unwrap_or(Duration::from_secs(1));
                return Err(PickError::AllCooling {
                    model: model.to_string(),
                    retry_after: wait,
                });
            }
            return Err(PickError::AllBlocked {
                provider: provider.to_string(),
            });
        }

        let sticky_key = format!("{provider}:{}", options.fingerprint);
        if !options.force_rotate && config.sticky_enabled {
            if let Some(stuck_id) = self.sticky.get(&sticky_key) {
                if let Some(auth) = pickable.iter().find(|a| a.id == stuck_id) {
                    return Ok((*auth).clone());
                }
                // Stuck-to auth no longer pickable: rotate silently, sticky
                // updates only on the successful pick below.
            }
        }

        let chosen = self.pick_scored(provider, model, &config, &pickable);
        debug!(
            provider,
            model,
            auth_id = %chosen.id,
            candidates = pickable.len(),
            "auth picked"
        );
        if config.sticky_enabled {
            self.sticky.set(&sticky_key, &chosen.id);
        }
        Ok(chosen)
    }

    fn pick_scored(
        &self,
        provider: &str,
        model: &str,
        config: &crate::quota::ProviderQuotaConfig,
        pickable: &[&Auth],
    ) -> Auth {
        let mut scored: Vec<(i64, &Auth)> = pickable
            .iter()
            .map(|auth| (self.quota.score(auth, config), *auth))
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let best = scored[0].0;
        let band: Vec<&Auth> = scored
            .iter()
            .take_while(|(score, _)| score - best <= SCORE_TIE_BAND)
            .map(|(_, auth)| *auth)
            .collect();

        if band.len() == 1 {
            return band[0].clone();
        }
        let idx = self.advance_rotation(provider, model, band.len());
        band[idx].clone()
    }

    /// Per-(provider, model) rotation counter, randomly seeded so restarts
    /// and sibling instances do not march in lockstep.
    fn advance_rotation(&self, provider: &str, model: &str, len: usize) -> usize {
        let key = (provider.to_string(), model.to_string());
        let mut guard = match self.rotation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = guard
            .entry(key)
            .or_insert_with(|| rand::rng().random_range(0..len.max(1)));
        let idx = *counter % len;
        *counter = counter.wrapping_add(1);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuthStatus, ModelState, QuotaState};
    use std::collections::HashSet;

    fn selector() -> Selector {
        Selector::new(Arc::new(StickyStore::new()), Arc::new(QuotaManager::new()))
    }

    fn auths(provider: &str, ids: &[&str]) -> Vec<Auth> {
        ids.iter().map(|id| Auth::new(*id, provider)).collect()
    }

    #[test]
    fn empty_candidates_is_auth_not_found() {
        let s = selector();
        let err = s
            .pick("gemini", "model", &PickOptions::default(), &[])
            .unwrap_err();
        assert!(matches!(err, PickError::AuthNotFound));
    }

    #[test]
    fn all_disabled_is_not_a_retryable_error() {
        let s = selector();
        let mut candidates = auths("gemini", &["a", "b"]);
        for auth in &mut candidates {
            auth.disabled = true;
        }
        let err = s
            .pick("gemini", "model", &PickOptions::default(), &candidates)
            .unwrap_err();
        assert!(matches!(err, PickError::AllBlocked { .. }));
    }

    #[test]
    fn disabled_entries_are_skipped() {
        let s = selector();
        let mut candidates = auths("gemini", &["a", "b", "c"]);
        candidates[0].disabled = true;
        candidates[2].status = AuthStatus::Disabled;
        let picked = s
            .pick(
                "gemini",
                "model",
                &PickOptions {
                    force_rotate: true,
                    ..PickOptions::default()
                },
                &candidates,
            )
            .unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn model_cooldown_blocks_and_reports_wait() {
        let s = selector();
        let now = now_epoch_seconds();
        let mut candidates = auths("gemini", &["a", "b"]);
        for auth in &mut candidates {
            auth.model_states.insert(
                "model".to_string(),
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
        }
        let err = s
            .pick("gemini", "model", &PickOptions::default(), &candidates)
            .unwrap_err();
        match err {
            PickError::AllCooling { model, retry_after } => {
                assert_eq!(model, "model");
                assert!(retry_after.as_secs() > 3500 && retry_after.as_secs() <= 3600);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn model_level_block_rolls_to_other_auth() {
        let s = selector();
        let now = now_epoch_seconds();
        let mut candidates = auths("gemini", &["a", "b"]);
        candidates[0].model_states.insert(
            "model-a".to_string(),
            ModelState {
                unavailable: true,
                next_retry_after: now + 3600,
                ..ModelState::default()
            },
        );
        let picked = s
            .pick(
                "gemini",
                "model-a",
                &PickOptions {
                    force_rotate: true,
                    ..PickOptions::default()
                },
                &candidates,
            )
            .unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn quota_cooldown_excludes_auth() {
        let sticky = Arc::new(StickyStore::new());
        let quota = Arc::new(QuotaManager::new());
        let s = Selector::new(sticky, Arc::clone(&quota));
        let candidates = auths("antigravity", &["a", "b"]);

        quota.record_quota_hit("a", "antigravity", "m", Some(Duration::from_secs(3600)));
        let picked = s
            .pick(
                "antigravity",
                "m",
                &PickOptions {
                    force_rotate: true,
                    ..PickOptions::default()
                },
                &candidates,
            )
            .unwrap();
        assert_eq!(picked.id, "b");

        quota.record_quota_hit("b", "antigravity", "m", Some(Duration::from_secs(3600)));
        let err = s
            .pick("antigravity", "m", &PickOptions::default(), &candidates)
            .unwrap_err();
        assert!(matches!(err, PickError::AllCooling { .. }));
    }

    #[test]
    fn sticky_returns_same_auth_until_rotated() {
        let s = selector();
        let candidates = auths("gemini", &["g1", "g2"]);
        let opts = PickOptions {
            force_rotate: false,
            fingerprint: "k".to_string(),
        };

        let first = s.pick("gemini", "model", &opts, &candidates).unwrap();
        let second = s.pick("gemini", "model", &opts, &candidates).unwrap();
        assert_eq!(first.id, second.id);

        // ForceRotate bypasses sticky but does not clear it for later calls.
        let _ = s
            .pick(
                "gemini",
                "model",
                &PickOptions {
                    force_rotate: true,
                    fingerprint: "k".to_string(),
                },
                &candidates,
            )
            .unwrap();
        let fourth = s.pick("gemini", "model", &opts, &candidates).unwrap();
        // Sticky was overwritten by the rotated pick; either way the result
        // must still be pickable and stable across the next call.
        let fifth = s.pick("gemini", "model", &opts, &candidates).unwrap();
        assert_eq!(fourth.id, fifth.id);
    }

    #[test]
    fn sticky_rotates_away_from_unpickable_auth() {
        let s = selector();
        let opts = PickOptions {
            fingerprint: "fp".to_string(),
            ..PickOptions::default()
        };
        let mut candidates = auths("claude", &["c1", "c2"]);
        let first = s.pick("claude", "m", &opts, &candidates).unwrap();

        // Disable the stuck-to auth; the selector must silently rotate.
        for auth in &mut candidates {
            if auth.id == first.id {
                auth.disabled = true;
            }
        }
        let second = s.pick("claude", "m", &opts, &candidates).unwrap();
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn antigravity_ignores_sticky_and_prefers_least_used() {
        let sticky = Arc::new(StickyStore::new());
        let quota = Arc::new(QuotaManager::new());
        let s = Selector::new(sticky, Arc::clone(&quota));
        let candidates = auths("antigravity", &["a1", "a2", "a3"]);

        quota.record_request_start("a1");
        quota.record_request_end("a1", "antigravity", 1_000_000, false);
        quota.record_request_start("a2");
        quota.record_request_end("a2", "antigravity", 500_000, false);
        quota.record_request_start("a3");
        quota.record_request_end("a3", "antigravity", 10_000, false);

        let picked = s
            .pick(
                "antigravity",
                "m",
                &PickOptions {
                    force_rotate: true,
                    ..PickOptions::default()
                },
                &candidates,
            )
            .unwrap();
        assert_eq!(picked.id, "a3");
    }

    #[test]
    fn round_robin_covers_all_tied_auths() {
        let s = selector();
        let candidates = auths("claude", &["c1", "c2", "c3"]);
        let opts = PickOptions {
            force_rotate: true,
            ..PickOptions::default()
        };

        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let picked = s.pick("claude", "claude-sonnet-4-5", &opts, &candidates).unwrap();
            *seen.entry(picked.id).or_default() += 1;
        }
        for auth in &candidates {
            assert!(
                seen.get(&auth.id).copied().unwrap_or(0) > 0,
                "auth {} never picked: {seen:?}",
                auth.id
            );
        }
        assert!(seen.values().all(|count| *count < 9));
    }

    #[test]
    fn rotation_repeats_with_stable_period() {
        let s = selector();
        let candidates = auths("test", &["a", "b", "c"]);
        let opts = PickOptions {
            force_rotate: true,
            ..PickOptions::default()
        };
        let picks: Vec<String> = (0..6)
            .map(|_| s.pick("test", "model", &opts, &candidates).unwrap().id)
            .collect();
        for i in 0..3 {
            assert_eq!(picks[i], picks[i + 3], "expected period-3 rotation: {picks:?}");
        }
        let distinct: HashSet<&String> = picks.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn concurrent_picks_are_safe() {
        let s = Arc::new(selector());
        let candidates = Arc::new(auths("gemini", &["a", "b", "c"]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&s);
            let candidates = Arc::clone(&candidates);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let picked = s
                        .pick("gemini", "model", &PickOptions::default(), &candidates)
                        .unwrap();
                    assert!(["a", "b", "c"].contains(&picked.id.as_str()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn picked_auth_is_always_pickable() {
        let s = selector();
        let now = now_epoch_seconds();
        let mut candidates = auths("gemini", &["a", "b", "c", "d"]);
        candidates[0].disabled = true;
        candidates[1].model_states.insert(
            "m".to_string(),
            ModelState {
                unavailable: true,
                next_retry_after: now + 60,
                ..ModelState::default()
            },
        );
        for _ in 0..20 {
            let picked = s
                .pick(
                    "gemini",
                    "m",
                    &PickOptions {
                        force_rotate: true,
                        ..PickOptions::default()
                    },
                    &candidates,
                )
                .unwrap();
            assert!(picked.is_pickable("m", now));
        }
    }
}
