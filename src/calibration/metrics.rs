/// Calibration-quality metrics over paired prediction history.
///
/// ECE is driven by outcome rank, not by the supplied confidences: each
/// sample's proxy confidence is its position `(idx+1)/len`, which assumes
/// the sequence is ordered by ascending confidence rank. MCE bins the true
/// confidences. The two therefore answer subtly different questions and are
/// not directly comparable.
use crate::calibration::{bin_index, bin_midpoint};
use crate::errors::{EngineError, EngineResult};
use smallvec::{smallvec, SmallVec};

/// Bin count shared by both calibration-error metrics.
pub(crate) const NUM_ERROR_BINS: usize = 10;

/// ECE reported when the window is too short to bin meaningfully.
const SHORT_WINDOW_ECE: f64 = 0.05;

/// Minimum samples before ECE is estimated from data.
const MIN_ECE_SAMPLES: usize = 10;

/// Snapshot of how well a set of predictions was calibrated.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CalibrationMetrics {
    pub expected_calibration_error: f64,
    pub maximum_calibration_error: f64,
    pub average_confidence: f64,
    pub average_accuracy: f64,
}

/// Compute calibration metrics over paired history. The one calibration
/// operation that errors instead of degrading: callers act on these numbers,
/// so a silently partial result is worse than a failure.
pub fn calibration_metrics(
    confidences: &[f64],
    accuracies: &[f64],
) -> EngineResult<CalibrationMetrics> {
    if confidences.len() != accuracies.len() {
        return Err(EngineError::LengthMismatch {
            confidences: confidences.len(),
            accuracies: accuracies.len(),
        });
    }

    Ok(CalibrationMetrics {
        expected_calibration_error: expected_calibration_error(accuracies, NUM_ERROR_BINS),
        maximum_calibration_error: maximum_calibration_error(confidences, accuracies),
        average_confidence: mean(confidences),
        average_accuracy: mean(accuracies),
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct BinAccum {
    samples: usize,
    outcome_sum: f64,
}

/// Sample-weighted average gap between bin confidence and realized accuracy.
/// Proxy confidence is positional: sample `idx` maps to `(idx+1)/len`.
/// Windows shorter than `MIN_ECE_SAMPLES` report `SHORT_WINDOW_ECE` instead
/// of over-reacting to a handful of outcomes.
pub(crate) fn expected_calibration_error(performance: &[f64], num_bins: usize) -> f64 {
    let len = performance.len();
    if len < MIN_ECE_SAMPLES {
        return SHORT_WINDOW_ECE;
    }

    let mut bins: SmallVec<[BinAccum; NUM_ERROR_BINS]> = smallvec![BinAccum::default(); num_bins];
    for (idx, &outcome) in performance.iter().enumerate() {
        let proxy = (idx as f64 + 1.0) / len as f64;
        if let Some(bin) = bin_index(proxy, num_bins) {
            bins[bin].samples += 1;
            bins[bin].outcome_sum += outcome;
        }
    }

    let assigned: usize = bins.iter().map(|b| b.samples).sum();
    if assigned == 0 {
        return 0.0;
    }

    let mut weighted_gap = 0.0;
    for (bin, accum) in bins.iter().enumerate() {
        if accum.samples == 0 {
            continue;
        }
        let bin_accuracy = accum.outcome_sum / accum.samples as f64;
        weighted_gap += accum.samples as f64 * (bin_accuracy - bin_midpoint(bin, num_bins)).abs();
    }
    weighted_gap / assigned as f64
}

/// Worst single-bin gap between realized accuracy and bin midpoint, binned
/// over the true confidences. A sample counts as correct only when its
/// accuracy is exactly 1.0.
fn maximum_calibration_error(confidences: &[f64], accuracies: &[f64]) -> f64 {
    let mut samples: SmallVec<[usize; NUM_ERROR_BINS]> = smallvec![0; NUM_ERROR_BINS];
    let mut correct: SmallVec<[usize; NUM_ERROR_BINS]> = smallvec![0; NUM_ERROR_BINS];

    for (idx, &conf) in confidences.iter().enumerate() {
        if let Some(bin) = bin_index(conf, NUM_ERROR_BINS) {
            samples[bin] += 1;
            if accuracies[idx] == 1.0 {
                correct[bin] += 1;
            }
        }
    }

    let mut max_gap = 0.0;
    for bin in 0..NUM_ERROR_BINS {
        if samples[bin] == 0 {
            continue;
        }
        let bin_accuracy = correct[bin] as f64 / samples[bin] as f64;
        let gap = (bin_accuracy - bin_midpoint(bin, NUM_ERROR_BINS)).abs();
        if gap > max_gap {
            max_gap = gap;
        }
    }
    max_gap
}

#[inline]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
