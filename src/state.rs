use crate::calibration::calibrator::{IsotonicTable, PlattParams};
use crate::calibration::metrics::CalibrationMetrics;
use portable_atomic::AtomicU64;
use std::collections::VecDeque;
use tokio::sync::oneshot;

// ── Upstream feed contract ──

/// One settled prediction from an upstream white-timing algorithm: the raw
/// confidence it reported and whether the call landed. The engine never sees
/// spins or wheel state, only these records.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutcomeRecord {
    pub algorithm: String,
    pub confidence: f64,
    pub correct: bool,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

impl OutcomeRecord {
    pub fn new(algorithm: impl Into<String>, confidence: f64, correct: bool) -> Self {
        Self {
            algorithm: algorithm.into(),
            confidence,
            correct,
            observed_at: chrono::Utc::now(),
        }
    }

    #[inline]
    pub fn hit(&self) -> f64 {
        if self.correct {
            1.0
        } else {
            0.0
        }
    }
}

// ── Messages INTO the engine (bounded channel) ──

#[derive(Debug)]
pub enum EngineEvent {
    /// A settled prediction to fold into the algorithm's windows.
    Outcome(OutcomeRecord),

    /// Calibrate a raw confidence against current fitted state.
    Calibrate {
        algorithm: String,
        raw_confidence: f64,
        reply: oneshot::Sender<f64>,
    },

    /// Calibration-quality metrics over the algorithm's stored history.
    /// Replies `None` for an algorithm with no recorded outcomes.
    Metrics {
        algorithm: String,
        reply: oneshot::Sender<Option<CalibrationMetrics>>,
    },

    /// Force a refit of one algorithm, or all of them.
    Retrain { algorithm: Option<String> },

    Shutdown,
}

// ── Per-algorithm rolling windows (ring buffers, capped) ──

/// Rolling history for one algorithm. Hit window feeds temperature
/// selection; the paired windows feed training and metrics.
#[derive(Debug)]
pub struct AlgorithmWindows {
    performance_cap: usize,
    training_cap: usize,
    pub recent_hits: VecDeque<f64>,
    pub confidences: VecDeque<f64>,
    pub accuracies: VecDeque<f64>,
    pub outcomes_seen: u64,
}

impl AlgorithmWindows {
    pub fn new(performance_cap: usize, training_cap: usize) -> Self {
        Self {
            performance_cap,
            training_cap,
            recent_hits: VecDeque::with_capacity(performance_cap),
            confidences: VecDeque::with_capacity(training_cap),
            accuracies: VecDeque::with_capacity(training_cap),
            outcomes_seen: 0,
        }
    }

    /// Fold in one settled prediction, evicting from the front at capacity.
    /// The confidence/accuracy windows move in lockstep, so their lengths
    /// always match.
    pub fn record(&mut self, confidence: f64, hit: f64) {
        if self.recent_hits.len() >= self.performance_cap {
            self.recent_hits.pop_front();
        }
        self.recent_hits.push_back(hit);

        if self.confidences.len() >= self.training_cap {
            self.confidences.pop_front();
            self.accuracies.pop_front();
        }
        self.confidences.push_back(confidence);
        self.accuracies.push_back(hit);

        self.outcomes_seen += 1;
    }

    pub fn recent_hits_vec(&self) -> Vec<f64> {
        self.recent_hits.iter().copied().collect()
    }

    pub fn training_vecs(&self) -> (Vec<f64>, Vec<f64>) {
        (
            self.confidences.iter().copied().collect(),
            self.accuracies.iter().copied().collect(),
        )
    }
}

// ── Engine snapshot (sent via watch channel) ──

/// Fitted calibration state for one algorithm. Serializable so a caller
/// that wants durability across restarts can persist and replay it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlgorithmSnapshot {
    pub algorithm: String,
    pub platt: PlattParams,
    pub isotonic: IsotonicTable,
    pub outcomes_seen: u64,
    pub training_samples: usize,
    pub recent_ece: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineSnapshot {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub algorithms: Vec<AlgorithmSnapshot>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            generated_at: chrono::Utc::now(),
            algorithms: Vec::new(),
        }
    }
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub outcomes_recorded: AtomicU64,
    pub calibrations_served: AtomicU64,
    pub metrics_served: AtomicU64,
    pub trainings_run: AtomicU64,
    pub replies_dropped: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            outcomes_recorded: AtomicU64::new(0),
            calibrations_served: AtomicU64::new(0),
            metrics_served: AtomicU64::new(0),
            trainings_run: AtomicU64::new(0),
            replies_dropped: AtomicU64::new(0),
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}
