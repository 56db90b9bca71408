/// Single-writer calibration service.
///
/// One task owns the calibrator and every per-algorithm window; callers
/// reach it through a bounded event channel and read fitted state from a
/// watch channel. Training and calibration for an algorithm can never
/// interleave, so a half-updated Platt/isotonic pair is never observable.
use crate::calibration::calibrator::ConfidenceCalibrator;
use crate::calibration::metrics::{self, CalibrationMetrics, NUM_ERROR_BINS};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::state::{
    AlgorithmSnapshot, AlgorithmWindows, EngineEvent, EngineSnapshot, OutcomeRecord, PerfCounters,
};
use portable_atomic::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Clonable front for the engine task. Dropping every handle closes the
/// event queue and lets the task wind down.
#[derive(Clone)]
pub struct CalibrationHandle {
    events: mpsc::Sender<EngineEvent>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
    counters: Arc<PerfCounters>,
}

impl CalibrationHandle {
    pub async fn record_outcome(&self, record: OutcomeRecord) -> EngineResult<()> {
        self.send(EngineEvent::Outcome(record)).await
    }

    /// Calibrate a raw confidence through the engine. Serializes with all
    /// previously queued events, so the reply reflects every outcome
    /// recorded before this call.
    pub async fn calibrate(&self, algorithm: &str, raw_confidence: f64) -> EngineResult<f64> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Calibrate {
            algorithm: algorithm.to_string(),
            raw_confidence,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::ChannelClosed("calibrate reply".into()))
    }

    /// Metrics over the algorithm's stored history; `None` for an algorithm
    /// the engine has never seen an outcome for.
    pub async fn metrics(&self, algorithm: &str) -> EngineResult<Option<CalibrationMetrics>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Metrics {
            algorithm: algorithm.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::ChannelClosed("metrics reply".into()))
    }

    /// Force a refit of one algorithm (`Some(id)`) or all of them (`None`).
    pub async fn retrain(&self, algorithm: Option<String>) -> EngineResult<()> {
        self.send(EngineEvent::Retrain { algorithm }).await
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        self.send(EngineEvent::Shutdown).await
    }

    /// Latest published snapshot. Cheap: a watch-channel borrow and clone.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    #[inline]
    pub fn counters(&self) -> &PerfCounters {
        &self.counters
    }

    async fn send(&self, event: EngineEvent) -> EngineResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| EngineError::ChannelClosed("engine event queue".into()))
    }
}

/// Spawn the engine task and return its handle.
pub fn spawn(config: EngineConfig) -> CalibrationHandle {
    let (handle, task) = channel(config);
    tokio::spawn(task);
    handle
}

/// Build the handle and the (unspawned) engine future. Lets callers and
/// tests own the join handle.
pub fn channel(
    config: EngineConfig,
) -> (CalibrationHandle, impl std::future::Future<Output = ()>) {
    let (events, rx) = mpsc::channel(config.event_queue_capacity);
    let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());
    let counters = Arc::new(PerfCounters::new());

    let handle = CalibrationHandle {
        events,
        snapshot_rx,
        counters: counters.clone(),
    };
    let task = run_calibration_engine(config, rx, snapshot_tx, counters);
    (handle, task)
}

/// Core engine loop. Receives events, updates windows, retrains on cadence,
/// publishes snapshots. Sole owner of all mutable calibration state.
pub async fn run_calibration_engine(
    config: EngineConfig,
    mut rx: mpsc::Receiver<EngineEvent>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    counters: Arc<PerfCounters>,
) {
    tracing::info!(
        performance_window = config.performance_window,
        training_window = config.training_window,
        retrain_interval = config.retrain_interval,
        "calibration engine started"
    );

    let mut calibrator = ConfidenceCalibrator::new();
    let mut windows: HashMap<String, AlgorithmWindows> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Outcome(record) => {
                counters.outcomes_recorded.fetch_add(1, Ordering::Relaxed);

                let window = windows.entry(record.algorithm.clone()).or_insert_with(|| {
                    tracing::info!(algorithm = %record.algorithm, "tracking new algorithm");
                    AlgorithmWindows::new(config.performance_window, config.training_window)
                });
                window.record(record.confidence, record.hit());

                if window.outcomes_seen % config.retrain_interval == 0 {
                    retrain_one(&mut calibrator, &record.algorithm, window, &counters);
                    publish_snapshot(&calibrator, &windows, &snapshot_tx);
                }
            }

            EngineEvent::Calibrate {
                algorithm,
                raw_confidence,
                reply,
            } => {
                counters.calibrations_served.fetch_add(1, Ordering::Relaxed);

                let recent = windows
                    .get(&algorithm)
                    .map(|w| w.recent_hits_vec())
                    .unwrap_or_default();
                let calibrated =
                    calibrator.calibrate_confidence(raw_confidence, &algorithm, &recent);

                if reply.send(calibrated).is_err() {
                    counters.replies_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(algorithm = %algorithm, "calibrate reply dropped");
                }
            }

            EngineEvent::Metrics { algorithm, reply } => {
                counters.metrics_served.fetch_add(1, Ordering::Relaxed);

                let result = windows.get(&algorithm).and_then(|w| {
                    let (confs, accs) = w.training_vecs();
                    match metrics::calibration_metrics(&confs, &accs) {
                        Ok(m) => Some(m),
                        // Unreachable: the windows move in lockstep.
                        Err(e) => {
                            tracing::error!(algorithm = %algorithm, error = %e, "metrics failed");
                            None
                        }
                    }
                });

                if reply.send(result).is_err() {
                    counters.replies_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }

            EngineEvent::Retrain { algorithm } => {
                match algorithm {
                    Some(id) => {
                        if let Some(window) = windows.get(&id) {
                            retrain_one(&mut calibrator, &id, window, &counters);
                        } else {
                            tracing::warn!(algorithm = %id, "retrain requested for unknown algorithm");
                        }
                    }
                    None => {
                        for (id, window) in &windows {
                            retrain_one(&mut calibrator, id, window, &counters);
                        }
                    }
                }
                publish_snapshot(&calibrator, &windows, &snapshot_tx);
            }

            EngineEvent::Shutdown => {
                tracing::info!("shutdown event received");
                break;
            }
        }
    }

    publish_snapshot(&calibrator, &windows, &snapshot_tx);
    tracing::info!("calibration engine shutting down");
}

fn retrain_one(
    calibrator: &mut ConfidenceCalibrator,
    algorithm: &str,
    window: &AlgorithmWindows,
    counters: &PerfCounters,
) {
    let (confs, accs) = window.training_vecs();
    calibrator.train(algorithm, &confs, &accs);
    counters.trainings_run.fetch_add(1, Ordering::Relaxed);
}

fn publish_snapshot(
    calibrator: &ConfidenceCalibrator,
    windows: &HashMap<String, AlgorithmWindows>,
    snapshot_tx: &watch::Sender<EngineSnapshot>,
) {
    let mut algorithms: Vec<AlgorithmSnapshot> = windows
        .iter()
        .map(|(id, window)| AlgorithmSnapshot {
            algorithm: id.clone(),
            platt: calibrator.platt_params(id),
            isotonic: calibrator.isotonic_table(id),
            outcomes_seen: window.outcomes_seen,
            training_samples: window.confidences.len(),
            recent_ece: metrics::expected_calibration_error(
                &window.recent_hits_vec(),
                NUM_ERROR_BINS,
            ),
        })
        .collect();
    algorithms.sort_by(|x, y| x.algorithm.cmp(&y.algorithm));

    let _ = snapshot_tx.send(EngineSnapshot {
        generated_at: chrono::Utc::now(),
        algorithms,
    });
}
