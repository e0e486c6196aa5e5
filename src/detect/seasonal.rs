//! Seasonal filtering: restrict a history window to points that share the
//! current point's context (same hour of day, same weekday, ...).

use serde::{Deserialize, Serialize};

use crate::model::{ContextValue, Measurement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalMode {
    /// A historical point must match every feature.
    Combined,
    /// A historical point must match at least one feature.
    Separate,
}

impl SeasonalMode {
    pub fn from_combined(combined: bool) -> Self {
        if combined {
            SeasonalMode::Combined
        } else {
            SeasonalMode::Separate
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextFilter {
    mode: SeasonalMode,
    required: Vec<(String, ContextValue)>,
}

impl ContextFilter {
    /// Build the filter for `current`. Features the current point does not
    /// carry are ignored; with none left, the filter passes everything.
    pub fn for_point(features: &[String], current: &Measurement, mode: SeasonalMode) -> Self {
        let required = features
            .iter()
            .filter_map(|name| {
                current
                    .context
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        Self { mode, required }
    }

    /// Whether the filter restricts anything at all.
    pub fn is_passthrough(&self) -> bool {
        self.required.is_empty()
    }

    pub fn matches(&self, candidate: &Measurement) -> bool {
        if self.required.is_empty() {
            return true;
        }
        let hit = |(name, want): &(String, ContextValue)| {
            candidate
                .context
                .get(name)
                .is_some_and(|have| same_value(have, want))
        };
        match self.mode {
            SeasonalMode::Combined => self.required.iter().all(hit),
            SeasonalMode::Separate => self.required.iter().any(hit),
        }
    }

    /// Summary for result metadata, e.g. `{"hour_of_day": 5}`.
    pub fn describe(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .required
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Integers and floats compare numerically; a stored `5` matches `5.0`.
fn same_value(a: &ContextValue, b: &ContextValue) -> bool {
    match (a, b) {
        (ContextValue::Int(x), ContextValue::Float(y)) | (ContextValue::Float(y), ContextValue::Int(x)) => {
            (*x as f64) == *y
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn point(hour: i64, weekday: &str) -> Measurement {
        Measurement::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hour), 1.0)
            .with_context("hour_of_day", hour % 24)
            .with_context("day_of_week", weekday)
    }

    fn features() -> Vec<String> {
        vec!["day_of_week".to_string(), "hour_of_day".to_string()]
    }

    #[test]
    fn test_combined_requires_all_features() {
        let current = point(9, "monday");
        let filter = ContextFilter::for_point(&features(), &current, SeasonalMode::Combined);

        assert!(filter.matches(&point(9, "monday")));
        assert!(!filter.matches(&point(9, "tuesday")));
        assert!(!filter.matches(&point(10, "monday")));
    }

    #[test]
    fn test_separate_accepts_any_feature() {
        let current = point(9, "monday");
        let filter = ContextFilter::for_point(&features(), &current, SeasonalMode::Separate);

        assert!(filter.matches(&point(9, "tuesday")));
        assert!(filter.matches(&point(10, "monday")));
        assert!(!filter.matches(&point(10, "tuesday")));
    }

    #[test]
    fn test_combined_is_subset_of_separate() {
        let current = point(9, "monday");
        let combined = ContextFilter::for_point(&features(), &current, SeasonalMode::Combined);
        let separate = ContextFilter::for_point(&features(), &current, SeasonalMode::Separate);

        let days = ["monday", "tuesday", "wednesday"];
        for h in 0..48 {
            for day in days {
                let candidate = point(h, day);
                if combined.matches(&candidate) {
                    assert!(separate.matches(&candidate), "hour {h} {day}");
                }
            }
        }
    }

    #[test]
    fn test_absent_features_are_ignored() {
        let current = Measurement::new(Utc::now(), 1.0).with_context("hour_of_day", 3i64);
        let filter = ContextFilter::for_point(&features(), &current, SeasonalMode::Combined);
        assert!(filter.matches(&point(3, "friday")));

        let bare = Measurement::new(Utc::now(), 1.0);
        let filter = ContextFilter::for_point(&features(), &bare, SeasonalMode::Combined);
        assert!(filter.is_passthrough());
        assert!(filter.matches(&point(17, "sunday")));
    }

    #[test]
    fn test_candidate_without_feature_does_not_match() {
        let current = point(9, "monday");
        let filter = ContextFilter::for_point(&features(), &current, SeasonalMode::Separate);
        assert!(!filter.matches(&Measurement::new(Utc::now(), 1.0)));
    }

    #[test]
    fn test_int_and_float_compare_numerically() {
        let current = Measurement::new(Utc::now(), 1.0).with_context("hour_of_day", 5i64);
        let filter = ContextFilter::for_point(&["hour_of_day".to_string()], &current, SeasonalMode::Combined);
        assert!(filter.matches(&Measurement::new(Utc::now(), 2.0).with_context("hour_of_day", 5.0)));
    }
}
