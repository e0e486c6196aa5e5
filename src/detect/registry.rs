//! Detector identity and construction.
//!
//! A detector without an explicit id is named by hashing its kind and its
//! effective parameters, with documented defaults stripped. Writing a
//! default out explicitly, or reordering keys, therefore never changes the
//! id, while any real tuning change does.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::params::{DetectorKind, DetectorParams, DetectorSpec};
use super::statistical::StatisticalDetector;
use super::threshold::ThresholdDetector;
use super::{ConfiguredDetector, Detector};
use crate::config::{ConfigError, DetectorConfig};

/// Hex characters kept from the digest.
pub const DETECTOR_ID_LEN: usize = 8;

/// Versioned table of documented parameter defaults, per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultTable {
    pub version: u32,
    threshold: BTreeMap<String, Value>,
    mad: BTreeMap<String, Value>,
    zscore: BTreeMap<String, Value>,
}

fn object_entries(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => BTreeMap::new(),
    }
}

impl DefaultTable {
    /// Defaults as shipped in the first release. Frozen: a changed default
    /// belongs in a new version, or every generated id would move.
    pub fn v1() -> Self {
        let threshold = json!({
            "operator": "gt",
            "mode": "static",
            "baseline": "previous",
        });
        let statistical = json!({
            "window_size": "30 days",
            "n_sigma": 3.0,
            "min_window_size": 100,
            "seasonal_features": [],
            "use_combined_seasonality": false,
            "use_weighted": false,
            "exp_decay_factor": 0.1,
        });
        Self {
            version: 1,
            threshold: object_entries(threshold),
            mad: object_entries(statistical.clone()),
            zscore: object_entries(statistical),
        }
    }

    pub fn defaults_for(&self, kind: DetectorKind) -> &BTreeMap<String, Value> {
        match kind {
            DetectorKind::Threshold => &self.threshold,
            DetectorKind::Mad => &self.mad,
            DetectorKind::Zscore => &self.zscore,
        }
    }

    pub fn is_default(&self, kind: DetectorKind, key: &str, value: &Value) -> bool {
        self.defaults_for(kind).get(key) == Some(value)
    }
}

impl Default for DefaultTable {
    fn default() -> Self {
        Self::v1()
    }
}

/// `kind:{sorted non-default params}`, the string that gets hashed.
pub fn canonical_form(params: &DetectorParams, defaults: &DefaultTable) -> String {
    let kind = params.kind();
    let effective: BTreeMap<String, Value> = object_entries(params.to_value())
        .into_iter()
        .filter(|(k, v)| !defaults.is_default(kind, k, v))
        .collect();
    // BTreeMap keys serialize in sorted order.
    let json = serde_json::to_string(&effective).unwrap_or_default();
    format!("{kind}:{json}")
}

/// Full SHA-256 hex digest of the canonical form.
pub fn detector_fingerprint(params: &DetectorParams, defaults: &DefaultTable) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_form(params, defaults).as_bytes());
    hex::encode(hasher.finalize())
}

/// Short deterministic id: the first eight hex characters of the fingerprint.
pub fn generate_detector_id(params: &DetectorParams, defaults: &DefaultTable) -> String {
    let mut id = detector_fingerprint(params, defaults);
    id.truncate(DETECTOR_ID_LEN);
    id
}

/// Turn raw detector entries for one metric into typed specs with ids.
/// Explicit ids are kept verbatim; two specs sharing an id is an error.
pub fn resolve_specs(
    metric_name: &str,
    configs: &[DetectorConfig],
    defaults: &DefaultTable,
) -> Result<Vec<DetectorSpec>, ConfigError> {
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(configs.len());

    for config in configs {
        let kind: DetectorKind = config.kind.parse()?;
        let params = DetectorParams::from_value(kind, config.params.clone())?;

        let id = match config.id.as_deref().map(str::trim) {
            Some("") => {
                return Err(ConfigError::InvalidMetric {
                    metric: metric_name.to_string(),
                    reason: "detector id cannot be empty".into(),
                })
            }
            Some(explicit) => explicit.to_string(),
            None => generate_detector_id(&params, defaults),
        };

        if !seen.insert(id.clone()) {
            return Err(ConfigError::DuplicateDetectorId {
                metric: metric_name.to_string(),
                id,
            });
        }
        specs.push(DetectorSpec { id, params });
    }

    Ok(specs)
}

type Constructor = fn(&DetectorParams) -> Option<Box<dyn Detector>>;

fn build_threshold(params: &DetectorParams) -> Option<Box<dyn Detector>> {
    match params {
        DetectorParams::Threshold(p) => Some(Box::new(ThresholdDetector::new(p.clone()))),
        _ => None,
    }
}

fn build_mad(params: &DetectorParams) -> Option<Box<dyn Detector>> {
    match params {
        DetectorParams::Mad(p) => Some(Box::new(StatisticalDetector::mad(p.clone()))),
        _ => None,
    }
}

fn build_zscore(params: &DetectorParams) -> Option<Box<dyn Detector>> {
    match params {
        DetectorParams::Zscore(p) => Some(Box::new(StatisticalDetector::zscore(p.clone()))),
        _ => None,
    }
}

/// Kind-to-constructor table, resolved once at startup.
pub struct DetectorRegistry {
    constructors: HashMap<DetectorKind, Constructor>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the threshold, MAD and Z-score detectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DetectorKind::Threshold, build_threshold);
        registry.register(DetectorKind::Mad, build_mad);
        registry.register(DetectorKind::Zscore, build_zscore);
        registry
    }

    pub fn register(&mut self, kind: DetectorKind, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Registered kinds, in a stable order.
    pub fn kinds(&self) -> Vec<DetectorKind> {
        let mut kinds: Vec<DetectorKind> = self.constructors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, spec: DetectorSpec) -> Result<ConfiguredDetector, ConfigError> {
        let kind = spec.kind();
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| ConfigError::UnknownDetectorKind(kind.to_string()))?;
        let detector = constructor(&spec.params).ok_or_else(|| ConfigError::InvalidParams {
            kind,
            reason: "parameters do not match detector kind".into(),
        })?;
        Ok(ConfiguredDetector::new(spec, detector))
    }

    pub fn build_all(&self, specs: Vec<DetectorSpec>) -> Result<Vec<ConfiguredDetector>, ConfigError> {
        specs.into_iter().map(|spec| self.build(spec)).collect()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::params::{StatisticalParams, ThresholdParams};

    fn id_for(kind: DetectorKind, params: Value) -> String {
        let params = DetectorParams::from_value(kind, params).unwrap();
        generate_detector_id(&params, &DefaultTable::v1())
    }

    #[test]
    fn test_v1_matches_current_defaults() {
        let table = DefaultTable::v1();
        let threshold = object_entries(serde_json::to_value(ThresholdParams::default()).unwrap());
        let statistical = object_entries(serde_json::to_value(StatisticalParams::default()).unwrap());
        assert_eq!(table.defaults_for(DetectorKind::Threshold), &threshold);
        assert_eq!(table.defaults_for(DetectorKind::Mad), &statistical);
        assert_eq!(table.defaults_for(DetectorKind::Zscore), &statistical);
    }

    #[test]
    fn test_id_shape() {
        let id = id_for(DetectorKind::Mad, json!({}));
        assert_eq!(id.len(), DETECTOR_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_id_ignores_key_order() {
        let a = id_for(
            DetectorKind::Mad,
            json!({"n_sigma": 5.0, "window_size": "14 days", "seasonal_features": ["hour_of_day", "day_of_week"]}),
        );
        let b = id_for(
            DetectorKind::Mad,
            json!({"seasonal_features": ["day_of_week", "hour_of_day"], "window_size": "2 weeks", "n_sigma": 5}),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_ignores_explicit_defaults() {
        let bare = id_for(DetectorKind::Zscore, json!({}));
        let spelled_out = id_for(
            DetectorKind::Zscore,
            json!({"n_sigma": 3.0, "window_size": "30 days", "min_window_size": 100, "use_weighted": false}),
        );
        assert_eq!(bare, spelled_out);
    }

    #[test]
    fn test_id_changes_with_params_and_kind() {
        let base = id_for(DetectorKind::Mad, json!({"n_sigma": 3.0}));
        assert_ne!(base, id_for(DetectorKind::Mad, json!({"n_sigma": 3.5})));
        assert_ne!(base, id_for(DetectorKind::Zscore, json!({"n_sigma": 3.0})));
        assert_ne!(
            base,
            id_for(DetectorKind::Mad, json!({"use_combined_seasonality": true}))
        );
    }

    #[test]
    fn test_canonical_form_drops_defaults() {
        let params = DetectorParams::from_value(DetectorKind::Mad, json!({"n_sigma": 4.0, "min_window_size": 100})).unwrap();
        assert_eq!(canonical_form(&params, &DefaultTable::v1()), r#"mad:{"n_sigma":4.0}"#);
    }

    #[test]
    fn test_fingerprint_prefix_is_id() {
        let params = DetectorParams::from_value(DetectorKind::Threshold, json!({"value": 10})).unwrap();
        let table = DefaultTable::v1();
        let fp = detector_fingerprint(&params, &table);
        assert_eq!(fp.len(), 64);
        assert!(fp.starts_with(&generate_detector_id(&params, &table)));
    }

    #[test]
    fn test_resolve_specs_keeps_explicit_ids() {
        let configs = vec![
            DetectorConfig::new("mad", json!({})).with_id("primary"),
            DetectorConfig::new("mad", json!({"n_sigma": 4.0})),
        ];
        let specs = resolve_specs("m", &configs, &DefaultTable::v1()).unwrap();
        assert_eq!(specs[0].id, "primary");
        assert_eq!(specs[1].id, id_for(DetectorKind::Mad, json!({"n_sigma": 4.0})));
    }

    #[test]
    fn test_resolve_specs_rejects_duplicates() {
        let configs = vec![
            DetectorConfig::new("mad", json!({"n_sigma": 3.0})),
            DetectorConfig::new("mad", json!({})),
        ];
        let err = resolve_specs("m", &configs, &DefaultTable::v1()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDetectorId { .. }));

        let configs = vec![
            DetectorConfig::new("mad", json!({})).with_id("x"),
            DetectorConfig::new("zscore", json!({})).with_id("x"),
        ];
        assert!(resolve_specs("m", &configs, &DefaultTable::v1()).is_err());
    }

    #[test]
    fn test_resolve_specs_rejects_unknown_kind() {
        let configs = vec![DetectorConfig::new("prophet", json!({}))];
        assert!(matches!(
            resolve_specs("m", &configs, &DefaultTable::v1()),
            Err(ConfigError::UnknownDetectorKind(_))
        ));
    }

    #[test]
    fn test_registry_builds_every_builtin() {
        let registry = DetectorRegistry::with_builtins();
        assert_eq!(registry.kinds(), DetectorKind::ALL.to_vec());

        for kind in DetectorKind::ALL {
            let params = match kind {
                DetectorKind::Threshold => json!({"value": 1.0}),
                _ => json!({}),
            };
            let spec = DetectorSpec {
                id: kind.to_string(),
                params: DetectorParams::from_value(kind, params).unwrap(),
            };
            let detector = registry.build(spec).unwrap();
            assert_eq!(detector.kind(), kind);
        }
    }

    #[test]
    fn test_empty_registry_rejects_build() {
        let registry = DetectorRegistry::new();
        let spec = DetectorSpec {
            id: "x".into(),
            params: DetectorParams::from_value(DetectorKind::Mad, json!({})).unwrap(),
        };
        assert!(matches!(
            registry.build(spec),
            Err(ConfigError::UnknownDetectorKind(_))
        ));
    }
}
