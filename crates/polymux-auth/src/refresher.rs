//! Background token refresh.
//!
//! A single loop evaluates every auth on a short interval and dispatches
//! refreshes through the provider layer. Concurrency is bounded by a
//! semaphore; a pending marker keeps an in-flight auth from being requeued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use polymux_common::{now_epoch_seconds, parse_duration_str, parse_duration_value, parse_epoch_value};

use crate::entry::{Auth, AuthStatus};
use crate::registry::{is_revoked_message, AuthRegistry};

const MAX_CONCURRENT_REFRESHES: usize = 10;
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const REFRESH_PENDING_BACKOFF: Duration = Duration::from_secs(60);
const REFRESH_FAILURE_BACKOFF: Duration = Duration::from_secs(5 * 60);
const STATS_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const STATS_CLEANUP_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct RefreshError {
    pub http_status: Option<u16>,
    pub message: String,
}

impl RefreshError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            message: message.into(),
        }
    }

    /// 400/401 from the token endpoint (or an explicit revoke message) means
    /// the refresh token is dead; retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self.http_status, Some(400) | Some(401)) || is_revoked_message(&self.message)
    }
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "refresh failed ({status}): {}", self.message),
            None => write!(f, "refresh failed: {}", self.message),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Provider-side refresh surface, implemented by the executor registry.
#[async_trait]
pub trait RefreshDispatch: Send + Sync {
    /// Perform the provider OAuth refresh and return the auth with new
    /// tokens and expiry in its metadata.
    async fn refresh(&self, auth: &Auth) -> Result<Auth, RefreshError>;

    /// How long before expiry this provider wants its tokens renewed.
    /// None means the provider does not participate in auto refresh.
    fn refresh_lead(&self, provider: &str) -> Option<Duration>;
}

pub struct Refresher {
    registry: Arc<AuthRegistry>,
    dispatch: Arc<dyn RefreshDispatch>,
    semaphore: Arc<Semaphore>,
    interval: Duration,
}

impl Refresher {
    pub fn new(
        registry: Arc<AuthRegistry>,
        dispatch: Arc<dyn RefreshDispatch>,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            dispatch,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_REFRESHES)),
            interval: interval.unwrap_or(REFRESH_CHECK_INTERVAL),
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cleanup = tokio::time::interval(STATS_CLEANUP_INTERVAL);
            cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First cleanup tick fires immediately; swallow it.
            cleanup.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = cleanup.tick() => {
                        let cutoff = now_epoch_seconds() - STATS_CLEANUP_AGE.as_secs() as i64;
                        let removed = self.registry.quota().cleanup_stale(cutoff);
                        if removed > 0 {
                            debug!(removed, "cleaned up stale quota states");
                        }
                    }
                }
            }
        })
    }

    /// One evaluation pass over the registry snapshot.
    pub async fn tick(&self) {
        let now = now_epoch_seconds();
        let snapshot = self.registry.list();
        debug!(count = snapshot.len(), "refresh check");
        for auth in snapshot {
            if auth.attr("account_type") == Some("api_key") {
                continue;
            }
            if !self.should_refresh(&auth, now) {
                continue;
            }

            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                debug!(auth_id = %auth.id, "refresh skipped: semaphore full");
                continue;
            };
            // Pending marker: the auth will not re-qualify while in flight.
            if self
                .registry
                .update(&auth.id, |entry| {
                    entry.next_refresh_after =
                        now + REFRESH_PENDING_BACKOFF.as_secs() as i64;
                })
                .is_none()
            {
                continue;
            }
            info!(auth_id = %auth.id, provider = %auth.provider, "triggering refresh");

            let registry = Arc::clone(&self.registry);
            let dispatch = Arc::clone(&self.dispatch);
            let auth_id = auth.id.clone();
            tokio::spawn(async move {
                let _permit = permit;
                refresh_one(registry, dispatch, &auth_id).await;
            });
        }
    }

    pub fn should_refresh(&self, auth: &Auth, now: i64) -> bool {
        if auth.disabled {
            return false;
        }
        if auth.next_refresh_after > 0 && now < auth.next_refresh_after {
            return false;
        }
        if let Some(evaluator) = &auth.runtime {
            return evaluator.should_refresh(now, auth);
        }

        let last_refresh = effective_last_refresh(auth);
        let expiry = auth.expiration_epoch();

        if let Some(interval) = preferred_interval(auth) {
            let interval_secs = interval.as_secs() as i64;
            if let Some(expiry) = expiry {
                if expiry <= now {
                    return true;
                }
                if expiry - now <= interval_secs {
                    return true;
                }
            }
            let Some(last) = last_refresh else {
                return true;
            };
            return now - last >= interval_secs;
        }

        let Some(lead) = self.dispatch.refresh_lead(&auth.provider.to_ascii_lowercase()) else {
            return false;
        };
        let lead_secs = lead.as_secs() as i64;
        if lead_secs <= 0 {
            return expiry.map(|e| now > e).unwrap_or(false);
        }
        if let Some(expiry) = expiry {
            return expiry - now <= lead_secs;
        }
        if let Some(last) = last_refresh {
            return now - last >= lead_secs;
        }
        true
    }
}

async fn refresh_one(
    registry: Arc<AuthRegistry>,
    dispatch: Arc<dyn RefreshDispatch>,
    auth_id: &str,
) {
    let Some(auth) = registry.get(auth_id) else {
        return;
    };
    match dispatch.refresh(&auth).await {
        Ok(refreshed) => {
            let now = now_epoch_seconds();
            registry.update(auth_id, |entry| {
                entry.metadata = refreshed.metadata.clone();
                entry.last_refreshed_at = now;
                entry.next_refresh_after = now + REFRESH_PENDING_BACKOFF.as_secs() as i64;
                if !entry.disabled && entry.status == AuthStatus::Error {
                    entry.status = AuthStatus::Active;
                    entry.status_message = None;
                }
            });
            info!(auth_id, "token refreshed");
        }
        Err(err) if err.is_permanent() => {
            warn!(auth_id, error = %err, "refresh token rejected, disabling auth");
            registry.update(auth_id, |entry| {
                entry.disabled = true;
                entry.status = AuthStatus::Disabled;
                entry.status_message = Some(err.to_string());
            });
        }
        Err(err) => {
            // Transient (network, 5xx): keep the old token and back off.
            warn!(auth_id, error = %err, "refresh failed, backing off");
            let now = now_epoch_seconds();
            registry.update(auth_id, |entry| {
                entry.next_refresh_after = now + REFRESH_FAILURE_BACKOFF.as_secs() as i64;
            });
        }
    }
}

fn preferred_interval(auth: &Auth) -> Option<Duration> {
    const KEYS: &[&str] = &[
        "refresh_interval_seconds",
        "refreshIntervalSeconds",
        "refresh_interval",
        "refreshInterval",
    ];
    for key in KEYS {
        if let Some(value) = auth.metadata.extra.get(*key) {
            if let Some(duration) = parse_duration_value(value) {
                return Some(duration);
            }
        }
    }
    for key in KEYS {
        if let Some(value) = auth.attributes.get(*key) {
            if let Some(duration) = parse_duration_str(value) {
                return Some(duration);
            }
        }
    }
    None
}

fn effective_last_refresh(auth: &Auth) -> Option<i64> {
    if auth.last_refreshed_at > 0 {
        return Some(auth.last_refreshed_at);
    }
    const KEYS: &[&str] = &[
        "last_refresh",
        "lastRefresh",
        "last_refreshed_at",
        "lastRefreshedAt",
    ];
    for key in KEYS {
        if let Some(value) = auth.metadata.extra.get(*key) {
            if let Some(epoch) = parse_epoch_value(value) {
                return Some(epoch);
            }
        }
    }
    for key in KEYS {
        if let Some(value) = auth.attributes.get(*key) {
            if let Some(epoch) = polymux_common::parse_epoch_str(value) {
                return Some(epoch);
            }
        }
    }
    None
}
