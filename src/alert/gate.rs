//! Cooldown gate: at most one dispatched alert per key per cooldown period.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// What a cooldown is tracked per.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AlertKey {
    pub metric_name: String,
    pub detector_id: String,
}

impl AlertKey {
    pub fn new(metric_name: impl Into<String>, detector_id: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            detector_id: detector_id.into(),
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.metric_name, self.detector_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Dispatch may proceed; `now` has been recorded for the key.
    Permitted { previous: Option<DateTime<Utc>> },
    /// Still cooling down since `last_dispatch`.
    Suppressed {
        last_dispatch: DateTime<Utc>,
        remaining: Duration,
    },
}

impl GateDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, GateDecision::Permitted { .. })
    }
}

/// In-process record of last dispatch time per key.
#[derive(Debug, Default)]
pub struct CooldownGate {
    last_dispatch: RwLock<HashMap<AlertKey, DateTime<Utc>>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_dispatch(&self, key: &AlertKey) -> Option<DateTime<Utc>> {
        let map = self.last_dispatch.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).copied()
    }

    /// Decide whether an alert for `key` may be sent at `now`.
    pub fn evaluate(&self, key: &AlertKey, now: DateTime<Utc>, cooldown: Duration) -> GateDecision {
        let mut map = self.last_dispatch.write().unwrap_or_else(|e| e.into_inner());
        let previous = map.get(key).copied();

        if let Some(last) = previous {
            let elapsed = now - last;
            if elapsed < cooldown {
                return GateDecision::Suppressed {
                    last_dispatch: last,
                    remaining: cooldown - elapsed,
                };
            }
        }

        map.insert(key.clone(), now);
        GateDecision::Permitted { previous }
    }

    /// Load a dispatch time recorded elsewhere (e.g. in storage). Keeps the
    /// later of the known and the seeded instant.
    pub fn seed(&self, key: AlertKey, at: DateTime<Utc>) {
        let mut map = self.last_dispatch.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .and_modify(|known| {
                if at > *known {
                    *known = at;
                }
            })
            .or_insert(at);
    }

    /// Undo a permit whose dispatch failed, provided nothing newer was
    /// recorded since.
    pub fn rollback(&self, key: &AlertKey, permitted_at: DateTime<Utc>, previous: Option<DateTime<Utc>>) {
        let mut map = self.last_dispatch.write().unwrap_or_else(|e| e.into_inner());
        if map.get(key) != Some(&permitted_at) {
            return;
        }
        match previous {
            Some(p) => {
                map.insert(key.clone(), p);
            }
            None => {
                map.remove(key);
            }
        }
    }
}
