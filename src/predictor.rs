//! Cost-sensitive online predictor used to size an elastic CPU subset's
//! active core window (spec §4.7), grounded on `PredictorCsoaa`
//! (`examples/original_source/schedulerlocal/predictor/predictor.py`).
//!
//! The original trains a per-iteration Vowpal Wabbit CSOAA model; no VW
//! binding exists in this crate's dependency stack, so the classifier is
//! replaced with a closed-form argmin over the same cost schedule,
//! evaluated against the historical peaks directly rather than a learned
//! regression surface. Everything else — the safeguard jump, the
//! buffer-full retrain trigger, the feature vector, the record pruning
//! window — follows the original.

use std::collections::HashMap;

/// One elastic subset owns exactly one predictor instance (spec §3).
#[derive(Debug, Clone)]
pub struct Predictor {
    monitoring_window: f64,
    monitoring_learning: f64,
    /// `SCL_ACT_LEEWAY`; read at startup and plumbed through for config
    /// completeness. Not consumed by the classifier below, which follows
    /// the fixed safeguard/retrain margins from the cost schedule.
    #[allow(dead_code)]
    monitoring_leeway: f64,

    /// feature vector -> (timestamp registered, observed peak).
    model_records: HashMap<String, (f64, f64)>,
    last_features: Option<String>,
    buffer_timestamp: f64,
    buffer_records: Vec<f64>,
    last_prediction: Option<u32>,
}

impl Predictor {
    pub fn new(monitoring_window: f64, monitoring_learning: f64, monitoring_leeway: f64) -> Self {
        Self {
            monitoring_window,
            monitoring_learning,
            monitoring_leeway,
            model_records: HashMap::new(),
            last_features: None,
            buffer_timestamp: 0.0,
            buffer_records: Vec::new(),
            last_prediction: None,
        }
    }

    /// Returns the active-window size (in cores) for the next iteration.
    ///
    /// Spec §4.7 lists the call as `(t, currentResources, allocation,
    /// metric)`; `allocation` is dropped here deliberately, not by
    /// oversight — in the original (`predictor.py`'s `predict`) it only
    /// ever feeds the debug/trace log line, never the prediction itself.
    pub fn predict(&mut self, timestamp: f64, current_resources: u32, metric: f64) -> u32 {
        self.buffer_records.push(metric);

        let Some(last_prediction) = self.last_prediction else {
            self.last_prediction = Some(current_resources);
            self.buffer_timestamp = timestamp;
            return current_resources;
        };

        let safeguard = current_resources > 0 && metric.ceil() as i64 >= last_prediction as i64;
        let buffer_full = (timestamp - self.buffer_timestamp) >= self.monitoring_learning;

        let prediction = if safeguard {
            (last_prediction + 5).min(current_resources)
        } else if buffer_full {
            let metrics = std::mem::take(&mut self.buffer_records);
            let predicted = self.predict_on_new_model(timestamp, current_resources, &metrics);
            self.buffer_timestamp = timestamp;
            ((predicted + 8.0).ceil() as u32).min(current_resources)
        } else {
            last_prediction
        };

        self.last_prediction = Some(prediction);
        prediction
    }

    fn predict_on_new_model(&mut self, timestamp: f64, current_resources: u32, metrics: &[f64]) -> f64 {
        let peak = metrics.iter().cloned().fold(f64::MIN, f64::max);
        if let Some(last_features) = self.last_features.take() {
            self.model_records.insert(last_features, (timestamp, peak));
        }
        self.prune_expired(timestamp);

        let current_features = feature_vector(metrics);

        if current_resources == 0 || !self.contains_enough_data(timestamp) {
            self.last_features = Some(current_features);
            return current_resources as f64;
        }

        let predicted_class = self.argmin_cost_class(current_resources);
        self.last_features = Some(current_features);
        predicted_class as f64 + std_dev(metrics)
    }

    fn prune_expired(&mut self, timestamp: f64) {
        self.model_records.retain(|_, (t, _)| timestamp - *t < self.monitoring_window);
    }

    fn contains_enough_data(&self, timestamp: f64) -> bool {
        if self.model_records.is_empty() {
            return false;
        }
        let oldest = self.model_records.values().map(|(t, _)| *t).fold(f64::INFINITY, f64::min);
        (timestamp - oldest) >= self.monitoring_window - self.monitoring_learning * 2.0
    }

    /// Class `c` in `{1..n}` minimizing the average cost across every
    /// recorded peak, where underprovisioning (`c < p`) costs
    /// `(n - p) + (p - c)` and overprovisioning (`c >= p`) costs `c - p`
    /// (spec §4.8 cost schedule).
    fn argmin_cost_class(&self, n: u32) -> u32 {
        let peaks: Vec<f64> = self.model_records.values().map(|(_, p)| *p).collect();
        if peaks.is_empty() || n == 0 {
            return n;
        }
        (1..=n)
            .min_by(|&a, &b| cost_of(a, n, &peaks).partial_cmp(&cost_of(b, n, &peaks)).unwrap())
            .unwrap_or(n)
    }
}

fn cost_of(c: u32, n: u32, peaks: &[f64]) -> f64 {
    peaks
        .iter()
        .map(|&p| {
            if (c as f64) < p {
                (n as f64 - p) + (p - c as f64)
            } else {
                c as f64 - p
            }
        })
        .sum::<f64>()
        / peaks.len() as f64
}

fn feature_vector(metrics: &[f64]) -> String {
    let min = metrics.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = metrics.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = metrics.iter().sum::<f64>() / metrics.len() as f64;
    let std = std_dev(metrics);
    let med = median(metrics);
    format!("min:{min:.3} max:{max:.3} avg:{avg:.3} std:{std:.3} med:{med:.3}")
}

fn std_dev(metrics: &[f64]) -> f64 {
    if metrics.is_empty() {
        return 0.0;
    }
    let avg = metrics.iter().sum::<f64>() / metrics.len() as f64;
    let variance = metrics.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / metrics.len() as f64;
    variance.sqrt()
}

fn median(metrics: &[f64]) -> f64 {
    let mut sorted = metrics.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_returns_current_resources_unchanged() {
        let mut p = Predictor::new(100.0, 10.0, 5.0);
        assert_eq!(p.predict(0.0, 4, 1.0), 4);
    }

    #[test]
    fn safeguard_jumps_when_metric_reaches_prediction() {
        let mut p = Predictor::new(100.0, 10.0, 5.0);
        p.predict(0.0, 4, 1.0);
        // metric.ceil() (4) >= last_prediction (4) triggers the safeguard.
        let next = p.predict(1.0, 8, 4.0);
        assert_eq!(next, 8); // min(4+5, 8)
    }

    #[test]
    fn stays_flat_before_buffer_fills_and_without_safeguard() {
        let mut p = Predictor::new(100.0, 10.0, 5.0);
        p.predict(0.0, 8, 2.0); // first call: last_prediction seeded to current_resources (8)
        let next = p.predict(1.0, 8, 1.0);
        assert_eq!(next, 8); // last_prediction carried, no safeguard/buffer_full
    }

    #[test]
    fn cost_of_prefers_exact_match_over_under_or_over_provision() {
        let peaks = vec![4.0];
        let exact = cost_of(4, 8, &peaks);
        let under = cost_of(2, 8, &peaks);
        let over = cost_of(6, 8, &peaks);
        assert_eq!(exact, 0.0);
        assert!(under > over); // underprovisioning penalized harder
    }

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }
}
