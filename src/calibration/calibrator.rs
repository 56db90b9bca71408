/// Multi-stage confidence calibration for white-timing prediction algorithms.
///
/// A raw algorithm confidence passes through three stages, each feeding the
/// next: temperature scaling driven by the algorithm's recent hit window,
/// Platt scaling through a per-algorithm sigmoid, then a nearest-neighbor
/// lookup into a per-algorithm isotonic table. State is partitioned by
/// algorithm id; training replaces an id's fitted state wholesale.
use crate::calibration::metrics::{expected_calibration_error, NUM_ERROR_BINS};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Temperature applied when the recent window shows overconfidence
/// (softens extreme confidences).
const OVERCONFIDENT_TEMPERATURE: f64 = 1.5;

/// Temperature applied when the recent window shows underconfidence
/// (sharpens).
const UNDERCONFIDENT_TEMPERATURE: f64 = 0.8;

/// Recent ECE above this marks an algorithm overconfident.
const OVERCONFIDENT_ECE: f64 = 0.10;

/// Recent ECE below this marks an algorithm underconfident.
const UNDERCONFIDENT_ECE: f64 = 0.02;

/// Minimum paired samples before training does anything.
const MIN_TRAINING_SAMPLES: usize = 10;

/// The isotonic table never exceeds this many bins.
pub const MAX_ISOTONIC_BINS: usize = 10;

/// Guards the log-odds division as confidence approaches 1.
const LOG_ODDS_EPSILON: f64 = 1e-8;

/// Platt sigmoid parameters: `1 / (1 + exp(a*x + b))`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(C)]
pub struct PlattParams {
    pub a: f64,
    pub b: f64,
}

impl Default for PlattParams {
    fn default() -> Self {
        Self { a: -1.0, b: 0.0 }
    }
}

/// One isotonic table entry: mean observed confidence of a training bin
/// mapped to the bin's mean observed accuracy.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(C)]
pub struct IsotonicPoint {
    pub confidence: f64,
    pub accuracy: f64,
}

/// Per-algorithm isotonic lookup table. At most `MAX_ISOTONIC_BINS` entries,
/// so it stays on the stack.
pub type IsotonicTable = SmallVec<[IsotonicPoint; MAX_ISOTONIC_BINS]>;

/// Per-algorithm calibration state. Two slots per id, both written only by
/// `train`; every read path is `&self`.
#[derive(Debug, Default)]
pub struct ConfidenceCalibrator {
    platt: HashMap<String, PlattParams>,
    isotonic: HashMap<String, IsotonicTable>,
}

impl ConfidenceCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calibrate a raw confidence for `algorithm` against its fitted state.
    /// Pure read: same inputs and same fitted state always produce the same
    /// output. Untrained algorithms fall back to the default sigmoid and a
    /// pass-through isotonic stage.
    pub fn calibrate_confidence(
        &self,
        raw_confidence: f64,
        algorithm: &str,
        recent_performance: &[f64],
    ) -> f64 {
        let temp_scaled = raw_confidence / select_temperature(recent_performance);
        let platt_scaled = self.apply_platt(algorithm, temp_scaled);
        self.apply_isotonic(algorithm, platt_scaled)
    }

    /// Fitted Platt parameters for `algorithm`, or the defaults. Reads never
    /// materialize a map entry; only `train` writes.
    #[inline]
    pub fn platt_params(&self, algorithm: &str) -> PlattParams {
        self.platt.get(algorithm).copied().unwrap_or_default()
    }

    /// Fitted isotonic table for `algorithm`. Empty when untrained.
    pub fn isotonic_table(&self, algorithm: &str) -> IsotonicTable {
        self.isotonic.get(algorithm).cloned().unwrap_or_default()
    }

    #[inline]
    pub fn is_trained(&self, algorithm: &str) -> bool {
        self.platt.contains_key(algorithm)
    }

    #[inline]
    fn apply_platt(&self, algorithm: &str, x: f64) -> f64 {
        let PlattParams { a, b } = self.platt_params(algorithm);
        1.0 / (1.0 + (a * x + b).exp())
    }

    /// Nearest table entry by absolute confidence distance. An empty table
    /// passes the Platt output through unchanged.
    fn apply_isotonic(&self, algorithm: &str, platt_scaled: f64) -> f64 {
        let Some(table) = self.isotonic.get(algorithm) else {
            return platt_scaled;
        };
        let Some(first) = table.first() else {
            return platt_scaled;
        };

        let mut best = *first;
        let mut best_dist = (first.confidence - platt_scaled).abs();
        for point in &table[1..] {
            let dist = (point.confidence - platt_scaled).abs();
            if dist < best_dist {
                best = *point;
                best_dist = dist;
            }
        }
        best.accuracy
    }

    /// Refit both stages for `algorithm` from paired history. Skipped
    /// entirely -- existing fitted state untouched -- on mismatched lengths
    /// or fewer than `MIN_TRAINING_SAMPLES` pairs.
    pub fn train(&mut self, algorithm: &str, confidences: &[f64], accuracies: &[f64]) {
        if confidences.len() != accuracies.len() || confidences.len() < MIN_TRAINING_SAMPLES {
            tracing::debug!(
                algorithm,
                confidences = confidences.len(),
                accuracies = accuracies.len(),
                "skipping calibrator training: insufficient history"
            );
            return;
        }

        self.train_platt(algorithm, confidences, accuracies);
        self.train_isotonic(algorithm, confidences, accuracies);

        tracing::debug!(algorithm, samples = confidences.len(), "calibrator trained");
    }

    /// Fixed-slope Platt fit: only the intercept tracks the history, as the
    /// gap between mean log-odds and mean accuracy.
    fn train_platt(&mut self, algorithm: &str, confidences: &[f64], accuracies: &[f64]) {
        let n = confidences.len() as f64;
        let mean_log_odds = confidences
            .iter()
            .map(|&c| (c / (1.0 - c + LOG_ODDS_EPSILON)).ln())
            .sum::<f64>()
            / n;
        let mean_accuracy = accuracies.iter().sum::<f64>() / n;

        let params = PlattParams {
            a: -1.0,
            b: mean_log_odds - mean_accuracy,
        };
        self.platt.insert(algorithm.to_string(), params);
    }

    /// Equal-count binning over the confidence-sorted pairs; each bin
    /// contributes one (mean confidence, mean accuracy) table entry. The
    /// last bin absorbs the division remainder so every sample is used.
    fn train_isotonic(&mut self, algorithm: &str, confidences: &[f64], accuracies: &[f64]) {
        let len = confidences.len();
        let num_bins = MAX_ISOTONIC_BINS.min(len / 3);

        let mut pairs: Vec<(f64, f64)> = confidences
            .iter()
            .copied()
            .zip(accuracies.iter().copied())
            .collect();
        pairs.sort_by(|x, y| x.0.total_cmp(&y.0));

        let bin_size = len / num_bins;
        let mut table = IsotonicTable::new();
        for bin in 0..num_bins {
            let start = bin * bin_size;
            let end = if bin == num_bins - 1 { len } else { start + bin_size };
            if start >= end {
                continue;
            }

            let members = &pairs[start..end];
            let m = members.len() as f64;
            table.push(IsotonicPoint {
                confidence: members.iter().map(|p| p.0).sum::<f64>() / m,
                accuracy: members.iter().map(|p| p.1).sum::<f64>() / m,
            });
        }

        self.isotonic.insert(algorithm.to_string(), table);
    }
}

/// Recent hit window decides the temperature: soften a historically
/// overconfident algorithm, sharpen an underconfident one, leave the rest
/// alone. Short windows land in the neutral band via the ECE fallback.
#[inline]
fn select_temperature(recent_performance: &[f64]) -> f64 {
    let ece = expected_calibration_error(recent_performance, NUM_ERROR_BINS);
    if ece > OVERCONFIDENT_ECE {
        OVERCONFIDENT_TEMPERATURE
    } else if ece < UNDERCONFIDENT_ECE {
        UNDERCONFIDENT_TEMPERATURE
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    /// 10 blocks of 20 outcomes; block b carries `ones(b)` hits. Under the
    /// positional proxy each block maps exactly onto ECE bin b.
    fn blocked_performance(ones: impl Fn(usize) -> usize) -> Vec<f64> {
        let mut perf = Vec::with_capacity(200);
        for block in 0..10 {
            let k = ones(block);
            for i in 0..20 {
                perf.push(if i < k { 1.0 } else { 0.0 });
            }
        }
        perf
    }

    #[test]
    fn test_untrained_output_stays_in_sigmoid_range() {
        let cal = ConfidenceCalibrator::new();
        let mut raw = 0.0;
        while raw <= 1.0 {
            let out = cal.calibrate_confidence(raw, "gap_analysis", &[]);
            assert!(out > 0.0 && out < 1.0, "raw {raw} gave {out}");
            // Empty window -> ECE fallback 0.05 -> neutral temperature.
            assert!((out - sigmoid(raw)).abs() < 1e-12);
            raw += 0.05;
        }
    }

    #[test]
    fn test_deterministic() {
        let mut cal = ConfidenceCalibrator::new();
        let confs: Vec<f64> = (0..20).map(|i| 0.3 + 0.02 * i as f64).collect();
        let accs: Vec<f64> = (0..20).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
        cal.train("temporal", &confs, &accs);

        let perf = vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let first = cal.calibrate_confidence(0.64, "temporal", &perf);
        for _ in 0..5 {
            assert_eq!(first, cal.calibrate_confidence(0.64, "temporal", &perf));
        }
    }

    #[test]
    fn test_overconfident_window_softens() {
        // All misses: every bin's accuracy is 0, ECE is the mean midpoint, ~0.5.
        let perf = vec![0.0; 20];
        let cal = ConfidenceCalibrator::new();
        let out = cal.calibrate_confidence(0.9, "sequence", &perf);
        assert!((out - sigmoid(0.9 / 1.5)).abs() < 1e-12, "expected T=1.5 path, got {out}");
    }

    #[test]
    fn test_calibrated_window_sharpens() {
        // Block b holds 2b+1 hits of 20: bin accuracy equals the bin
        // midpoint, so ECE is exactly 0 and the sharpening branch fires.
        let perf = blocked_performance(|b| 2 * b + 1);
        let cal = ConfidenceCalibrator::new();
        let out = cal.calibrate_confidence(0.6, "risk", &perf);
        assert!((out - sigmoid(0.6 / 0.8)).abs() < 1e-12, "expected T=0.8 path, got {out}");
    }

    #[test]
    fn test_mid_band_window_is_neutral() {
        // Block b holds 2b hits: every bin misses its midpoint by exactly
        // 0.05, inside the neutral band.
        let perf = blocked_performance(|b| 2 * b);
        let cal = ConfidenceCalibrator::new();
        let out = cal.calibrate_confidence(0.6, "ensemble", &perf);
        assert!((out - sigmoid(0.6)).abs() < 1e-12, "expected T=1.0 path, got {out}");
    }

    #[test]
    fn test_short_training_batch_is_a_noop() {
        let mut cal = ConfidenceCalibrator::new();
        let before = cal.calibrate_confidence(0.7, "gap_analysis", &[]);

        cal.train("gap_analysis", &[0.2, 0.4, 0.6, 0.8, 0.9], &[0.0, 0.0, 1.0, 1.0, 1.0]);

        assert!(!cal.is_trained("gap_analysis"));
        assert_eq!(before, cal.calibrate_confidence(0.7, "gap_analysis", &[]));
    }

    #[test]
    fn test_mismatched_training_batch_is_a_noop() {
        let mut cal = ConfidenceCalibrator::new();
        let confs: Vec<f64> = (0..12).map(|i| i as f64 / 12.0).collect();
        let accs: Vec<f64> = (0..11).map(|_| 1.0).collect();

        cal.train("temporal", &confs, &accs);

        assert!(!cal.is_trained("temporal"));
        assert!(cal.isotonic_table("temporal").is_empty());
    }

    #[test]
    fn test_training_populates_both_stages() {
        let mut cal = ConfidenceCalibrator::new();
        let confs: Vec<f64> = (0..12).map(|i| 0.2 + 0.05 * i as f64).collect();
        let accs: Vec<f64> = (0..12).map(|i| if i >= 6 { 1.0 } else { 0.0 }).collect();

        cal.train("sequence", &confs, &accs);

        assert!(cal.is_trained("sequence"));
        // 12 samples -> min(10, 12/3) = 4 bins of 3.
        let table = cal.isotonic_table("sequence");
        assert_eq!(table.len(), 4);

        // With a populated table the output is always some bin's accuracy.
        let out = cal.calibrate_confidence(0.5, "sequence", &[]);
        assert!(
            table.iter().any(|p| (p.accuracy - out).abs() < 1e-12),
            "output {out} not drawn from the table"
        );
    }

    #[test]
    fn test_nearest_neighbor_lookup() {
        let mut cal = ConfidenceCalibrator::new();
        let confs: Vec<f64> = (0..12).map(|i| 0.2 + 0.05 * i as f64).collect();
        let accs: Vec<f64> = (0..12).map(|i| if i >= 6 { 1.0 } else { 0.0 }).collect();
        cal.train("sequence", &confs, &accs);

        let params = cal.platt_params("sequence");
        let table = cal.isotonic_table("sequence");

        // Recompute the pipeline by hand and pick the nearest entry.
        let raw = 0.85;
        let platt_scaled = 1.0 / (1.0 + (params.a * raw + params.b).exp());
        let expected = table
            .iter()
            .min_by(|x, y| {
                (x.confidence - platt_scaled)
                    .abs()
                    .total_cmp(&(y.confidence - platt_scaled).abs())
            })
            .map(|p| p.accuracy)
            .unwrap();

        assert_eq!(expected, cal.calibrate_confidence(raw, "sequence", &[]));
    }

    #[test]
    fn test_fixed_slope_and_intercept_heuristic() {
        let mut cal = ConfidenceCalibrator::new();
        // Flat 0.5 confidences: log-odds ~ 0, so b ~ -mean accuracy.
        let confs = vec![0.5; 10];
        let accs = vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];

        cal.train("temporal", &confs, &accs);

        let params = cal.platt_params("temporal");
        assert_eq!(params.a, -1.0);
        assert!((params.b + 0.5).abs() < 1e-6, "b = {}", params.b);
    }

    #[test]
    fn test_retraining_is_idempotent() {
        let confs: Vec<f64> = (0..30).map(|i| i as f64 / 30.0 + 0.01).collect();
        let accs: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();

        let mut once = ConfidenceCalibrator::new();
        once.train("risk", &confs, &accs);

        let mut twice = ConfidenceCalibrator::new();
        twice.train("risk", &confs, &accs);
        twice.train("risk", &confs, &accs);

        assert_eq!(once.platt_params("risk"), twice.platt_params("risk"));
        assert_eq!(
            once.isotonic_table("risk").as_slice(),
            twice.isotonic_table("risk").as_slice()
        );
    }

    #[test]
    fn test_training_replaces_rather_than_merges() {
        let mut cal = ConfidenceCalibrator::new();

        // 30 samples -> 10 bins.
        let confs: Vec<f64> = (0..30).map(|i| i as f64 / 30.0 + 0.01).collect();
        let accs = vec![1.0; 30];
        cal.train("gap_analysis", &confs, &accs);
        assert_eq!(cal.isotonic_table("gap_analysis").len(), 10);

        // Retrain on 12 samples -> 4 bins; the old table is gone.
        cal.train("gap_analysis", &confs[..12], &accs[..12]);
        assert_eq!(cal.isotonic_table("gap_analysis").len(), 4);
    }

    #[test]
    fn test_algorithms_are_independent() {
        let mut cal = ConfidenceCalibrator::new();
        let confs: Vec<f64> = (0..12).map(|i| 0.3 + 0.04 * i as f64).collect();
        let accs = vec![1.0; 12];

        cal.train("gap_analysis", &confs, &accs);

        assert!(cal.is_trained("gap_analysis"));
        assert!(!cal.is_trained("temporal"));
        let untouched = cal.calibrate_confidence(0.7, "temporal", &[]);
        assert!((untouched - sigmoid(0.7)).abs() < 1e-12);
    }
}
