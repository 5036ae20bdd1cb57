//! Quota cooldown backoff: 2^level seconds, capped at 30 minutes. Once the
//! cap is hit the level freezes so a later success can still reset it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MAX_QUOTA_COOLDOWN: Duration = Duration::from_secs(30 * 60);

static QUOTA_COOLDOWN_DISABLED: AtomicBool = AtomicBool::new(false);

/// Global switch (`disable-cooling` in config): quota hits stop producing
/// cooldowns, levels stay untouched.
pub fn set_quota_cooldown_disabled(disabled: bool) {
    QUOTA_COOLDOWN_DISABLED.store(disabled, Ordering::Relaxed);
}

pub fn quota_cooldown_disabled() -> bool {
    QUOTA_COOLDOWN_DISABLED.load(Ordering::Relaxed)
}

/// Next cooldown for an auth at `prev_level`, and the level to store.
pub fn next_quota_cooldown(prev_level: i32) -> (Duration, i32) {
    if quota_cooldown_disabled() {
        return (Duration::ZERO, prev_level);
    }
    let level = prev_level.max(0);
    let secs = 1u64.checked_shl(level as u32).unwrap_or(u64::MAX);
    if secs >= MAX_QUOTA_COOLDOWN.as_secs() {
        (MAX_QUOTA_COOLDOWN, prev_level)
    } else {
        (Duration::from_secs(secs), level + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let cases = [
            (0, 1, 1),
            (1, 2, 2),
            (2, 4, 3),
            (3, 8, 4),
            (10, 1024, 11),
        ];
        for (prev, secs, next) in cases {
            let (cooldown, level) = next_quota_cooldown(prev);
            assert_eq!(cooldown, Duration::from_secs(secs), "level {prev}");
            assert_eq!(level, next, "level {prev}");
        }
    }

    #[test]
    fn high_level_caps_at_thirty_minutes_and_freezes() {
        let (cooldown, level) = next_quota_cooldown(20);
        assert_eq!(cooldown, Duration::from_secs(1800));
        assert_eq!(level, 20);
    }

    #[test]
    fn negative_level_treated_as_zero() {
        let (cooldown, level) = next_quota_cooldown(-1);
        assert_eq!(cooldown, Duration::from_secs(1));
        assert_eq!(level, 1);
    }

    #[test]
    fn disabled_returns_zero_and_keeps_level() {
        set_quota_cooldown_disabled(true);
        let (cooldown, level) = next_quota_cooldown(5);
        set_quota_cooldown_disabled(false);
        assert_eq!(cooldown, Duration::ZERO);
        assert_eq!(level, 5);
    }
}
