//! Plain and weighted summary statistics over a sample.

use chrono::{DateTime, Utc};

/// Scale that makes the MAD a consistent estimator of the standard
/// deviation for normally distributed data.
pub const MAD_SCALE: f64 = 1.4826;

/// A sample of values, optionally weighted.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    values: Vec<f64>,
    weights: Option<Vec<f64>>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, weights: None }
    }

    /// `weights` must be the same length as `values` and non-negative.
    pub fn weighted(values: Vec<f64>, weights: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), weights.len());
        Self {
            values,
            weights: Some(weights),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }

    fn total_weight(&self) -> f64 {
        match &self.weights {
            Some(w) => w.iter().sum(),
            None => self.values.len() as f64,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        match &self.weights {
            None => self.values.iter().sum::<f64>() / self.values.len() as f64,
            Some(w) => {
                let total = self.total_weight();
                if total <= 0.0 {
                    return 0.0;
                }
                self.values.iter().zip(w).map(|(v, w)| v * w).sum::<f64>() / total
            }
        }
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        match &self.weights {
            None => {
                let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
                sum_sq_diff / self.values.len() as f64
            }
            Some(w) => {
                let total = self.total_weight();
                if total <= 0.0 {
                    return 0.0;
                }
                self.values
                    .iter()
                    .zip(w)
                    .map(|(&x, w)| w * (x - mean).powi(2))
                    .sum::<f64>()
                    / total
            }
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Median. Unweighted samples of even length average the two middle
    /// values; weighted samples take the first value whose cumulative
    /// weight reaches half the total.
    pub fn median(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        match &self.weights {
            None => {
                let mut sorted = self.values.clone();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Some(w) => weighted_median(&self.values, w),
        }
    }

    /// Scaled median absolute deviation around the median, using the same
    /// weights as the sample.
    pub fn mad(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let median = self.median();
        let deviations: Vec<f64> = self.values.iter().map(|v| (v - median).abs()).collect();
        let spread = Self {
            values: deviations,
            weights: self.weights.clone(),
        };
        spread.median() * MAD_SCALE
    }
}

fn weighted_median(values: &[f64], weights: &[f64]) -> f64 {
    let mut pairs: Vec<(f64, f64)> = values.iter().copied().zip(weights.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return TimeSeries::new(values.to_vec()).median();
    }

    let half = total / 2.0;
    let mut cumulative = 0.0;
    for (value, weight) in &pairs {
        cumulative += weight;
        if cumulative >= half {
            return *value;
        }
    }
    pairs.last().map_or(0.0, |(v, _)| *v)
}

/// Exponential decay weights, `exp(-decay * age_in_days)`, relative to `now`.
pub fn decay_weights(timestamps: &[DateTime<Utc>], now: DateTime<Utc>, decay: f64) -> Vec<f64> {
    timestamps
        .iter()
        .map(|ts| {
            let age_days = (now - *ts).num_seconds().max(0) as f64 / 86_400.0;
            (-decay * age_days).exp()
        })
        .collect()
}
