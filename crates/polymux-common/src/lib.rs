//! Small shared helpers: wall-clock epoch math, fnv hashing, and the
//! permissive duration/timestamp parsing used by auth metadata.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

pub fn epoch_to_system_time(epoch_secs: i64) -> SystemTime {
    if epoch_secs <= 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_secs(epoch_secs as u64)
}

/// Seconds until `epoch_secs`, negative if already past.
pub fn seconds_until(epoch_secs: i64) -> i64 {
    epoch_secs - now_epoch_seconds()
}

/// 32-bit FNV-1a. Used for deterministic per-credential choices (outgoing
/// fingerprint preset, score dispersion) that must survive restarts.
pub fn fnv32a(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Parse a duration out of loosely-typed metadata values: integer or float
/// seconds, numeric strings, or suffixed strings like "30m" / "2h" / "90s".
pub fn parse_duration_value(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::Number(num) => {
            if let Some(secs) = num.as_i64() {
                return positive_secs(secs);
            }
            num.as_f64()
                .filter(|v| *v > 0.0)
                .map(Duration::from_secs_f64)
        }
        serde_json::Value::String(text) => parse_duration_str(text),
        _ => None,
    }
}

pub fn parse_duration_str(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<i64>() {
        return positive_secs(secs);
    }
    let (digits, unit) = text.split_at(text.len() - 1);
    let value = digits.trim().parse::<u64>().ok()?;
    if value == 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        "d" => Some(Duration::from_secs(value * 86400)),
        _ => None,
    }
}

fn positive_secs(secs: i64) -> Option<Duration> {
    if secs > 0 {
        Some(Duration::from_secs(secs as u64))
    } else {
        None
    }
}

/// Parse a timestamp out of loosely-typed metadata: epoch seconds, epoch
/// milliseconds (heuristically, values past year ~33658), or RFC 3339.
pub fn parse_epoch_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(num) => {
            let raw = num.as_i64().or_else(|| num.as_f64().map(|v| v as i64))?;
            if raw <= 0 {
                return None;
            }
            if raw > 1_000_000_000_000 {
                Some(raw / 1000)
            } else {
                Some(raw)
            }
        }
        serde_json::Value::String(text) => parse_epoch_str(text),
        _ => None,
    }
}

pub fn parse_epoch_str(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(raw) = text.parse::<i64>() {
        if raw <= 0 {
            return None;
        }
        return Some(if raw > 1_000_000_000_000 { raw / 1000 } else { raw });
    }
    parse_rfc3339(text)
}

/// Minimal RFC 3339 parser covering `YYYY-MM-DDTHH:MM:SS` with optional
/// fractional seconds and `Z` or `±HH:MM` offsets. Auth files written by
/// other tooling use this shape for expiry fields.
fn parse_rfc3339(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    if bytes.len() < 19 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[13] != b':' {
        return None;
    }
    let year: i64 = text.get(0..4)?.parse().ok()?;
    let month: i64 = text.get(5..7)?.parse().ok()?;
    let day: i64 = text.get(8..10)?.parse().ok()?;
    let hour: i64 = text.get(11..13)?.parse().ok()?;
    let minute: i64 = text.get(14..16)?.parse().ok()?;
    let second: i64 = text.get(17..19)?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let rest = &text[19..];
    let offset_secs = if rest.is_empty() || rest.ends_with('Z') || rest.ends_with('z') {
        0
    } else {
        let offset_start = rest.rfind(['+', '-'])?;
        let offset = &rest[offset_start..];
        let sign = if offset.starts_with('-') { -1 } else { 1 };
        let oh: i64 = offset.get(1..3)?.parse().ok()?;
        let om: i64 = offset.get(4..6)?.parse().ok()?;
        sign * (oh * 3600 + om * 60)
    };

    let days = days_from_civil(year, month, day);
    Some(days * 86400 + hour * 3600 + minute * 60 + second - offset_secs)
}

// Howard Hinnant's civil-days algorithm.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv32a_matches_reference_vectors() {
        assert_eq!(fnv32a(""), 0x811c9dc5);
        assert_eq!(fnv32a("a"), 0xe40c292c);
        assert_eq!(fnv32a("foobar"), 0xbf9cf968);
    }

    #[test]
    fn duration_parsing_accepts_numbers_and_suffixes() {
        assert_eq!(
            parse_duration_value(&serde_json::json!(3600)),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            parse_duration_value(&serde_json::json!(3600.0)),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            parse_duration_value(&serde_json::json!("3600")),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(parse_duration_str("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration_str("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration_str(""), None);
        assert_eq!(parse_duration_str("-5"), None);
    }

    #[test]
    fn epoch_parsing_handles_millis_and_rfc3339() {
        assert_eq!(parse_epoch_value(&serde_json::json!(1700000000)), Some(1700000000));
        assert_eq!(
            parse_epoch_value(&serde_json::json!(1700000000123_i64)),
            Some(1700000000)
        );
        assert_eq!(parse_epoch_str("1970-01-01T00:00:00Z"), Some(0));
        assert_eq!(parse_epoch_str("2023-11-14T22:13:20Z"), Some(1700000000));
        assert_eq!(parse_epoch_str("2023-11-14T23:13:20+01:00"), Some(1700000000));
        assert_eq!(parse_epoch_str("not a time"), None);
    }
}
