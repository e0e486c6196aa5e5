//! Calendar features derived from a measurement's timestamp.
//!
//! Collectors may attach arbitrary context themselves; the annotator only
//! fills in features that are missing, so source-provided values win.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::config::ConfigError;
use crate::model::{ContextValue, Measurement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalendarFeature {
    HourOfDay,
    DayOfWeek,
    DayOfMonth,
    Month,
    IsWeekend,
}

impl CalendarFeature {
    pub fn name(&self) -> &'static str {
        match self {
            CalendarFeature::HourOfDay => "hour_of_day",
            CalendarFeature::DayOfWeek => "day_of_week",
            CalendarFeature::DayOfMonth => "day_of_month",
            CalendarFeature::Month => "month",
            CalendarFeature::IsWeekend => "is_weekend",
        }
    }

    pub fn value_at(&self, ts: DateTime<Utc>) -> ContextValue {
        match self {
            CalendarFeature::HourOfDay => ts.hour().into(),
            CalendarFeature::DayOfWeek => weekday_name(ts.weekday()).into(),
            CalendarFeature::DayOfMonth => ts.day().into(),
            CalendarFeature::Month => ts.month().into(),
            CalendarFeature::IsWeekend => matches!(ts.weekday(), Weekday::Sat | Weekday::Sun).into(),
        }
    }
}

impl FromStr for CalendarFeature {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour_of_day" | "hour" => Ok(CalendarFeature::HourOfDay),
            "day_of_week" | "weekday" => Ok(CalendarFeature::DayOfWeek),
            "day_of_month" => Ok(CalendarFeature::DayOfMonth),
            "month" => Ok(CalendarFeature::Month),
            "is_weekend" => Ok(CalendarFeature::IsWeekend),
            other => Err(ConfigError::UnknownFeature(other.to_string())),
        }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Attaches a fixed set of calendar features to measurements.
#[derive(Debug, Clone, Default)]
pub struct ContextAnnotator {
    features: Vec<CalendarFeature>,
}

impl ContextAnnotator {
    pub fn new(features: Vec<CalendarFeature>) -> Self {
        Self { features }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let features = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { features })
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn annotate(&self, measurement: &mut Measurement) {
        let ts = measurement.timestamp;
        for feature in &self.features {
            measurement
                .context
                .entry(feature.name().to_string())
                .or_insert_with(|| feature.value_at(ts));
        }
    }

    pub fn annotate_all(&self, measurements: &mut [Measurement]) {
        if self.features.is_empty() {
            return;
        }
        for m in measurements.iter_mut() {
            self.annotate(m);
        }
    }
}
