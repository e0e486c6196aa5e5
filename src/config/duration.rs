//! Human-readable durations ("30 days", "10 minutes", "15m").

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serializer};

use super::ConfigError;

const UNITS: [(&str, i64); 5] = [
    ("week", 7 * 86_400),
    ("day", 86_400),
    ("hour", 3_600),
    ("minute", 60),
    ("second", 1),
];

/// Longest accepted duration, in days (about a century).
pub const MAX_DURATION_DAYS: i64 = 36_500;

/// Upper bound for every configured duration.
pub fn max_duration() -> Duration {
    Duration::days(MAX_DURATION_DAYS)
}

/// Parse `"<amount> <unit>"` or the compact `"<amount><suffix>"` form.
///
/// Units may be singular or plural; compact suffixes are `s`, `m`, `h`, `d`, `w`.
/// Zero is accepted (a zero cooldown is meaningful), negative amounts and
/// anything past [`MAX_DURATION_DAYS`] are not.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let normalized = input.trim().to_ascii_lowercase();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let (amount, unit) = match tokens.as_slice() {
        [amount, unit] => (amount.to_string(), unit.to_string()),
        [compact] => {
            let split = compact
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| invalid("missing unit"))?;
            let (amount, unit) = compact.split_at(split);
            (amount.to_string(), unit.to_string())
        }
        _ => return Err(invalid("expected '<number> <unit>'")),
    };

    let amount: i64 = amount
        .parse()
        .map_err(|_| invalid("amount must be a non-negative integer"))?;
    if amount < 0 {
        return Err(invalid("amount must be a non-negative integer"));
    }

    let unit_secs = match unit.as_str() {
        "w" | "week" | "weeks" => 7 * 86_400,
        "d" | "day" | "days" => 86_400,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        _ => return Err(invalid("unknown unit")),
    };

    amount
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_DURATION_DAYS * 86_400)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| invalid("out of range"))
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs == 0 {
        return "0 seconds".to_string();
    }
    for (name, unit_secs) in UNITS {
        if secs % unit_secs == 0 {
            let amount = secs / unit_secs;
            let plural = if amount == 1 { "" } else { "s" };
            return format!("{amount} {name}{plural}");
        }
    }
    unreachable!("seconds always divide evenly")
}

/// `#[serde(with = "human")]` for `chrono::Duration` fields.
pub mod human {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "human_opt")]` for `Option<chrono::Duration>` fields.
pub mod human_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|r| parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}
