use crate::errors::{EngineError, EngineResult};

/// Service-level knobs for the calibration engine. The numeric constants of
/// the calibration pipeline itself (temperatures, ECE bands, bin counts) are
/// module consts in `calibration` -- they define the algorithm and are not
/// tunable at runtime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recent-outcome window per algorithm, fed to temperature selection.
    pub performance_window: usize,
    /// Paired (confidence, accuracy) training history cap per algorithm.
    pub training_window: usize,
    /// Refit an algorithm's calibration every N recorded outcomes.
    pub retrain_interval: u64,
    /// Capacity of the bounded event queue into the engine task.
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            performance_window: 50,
            training_window: 500,
            retrain_interval: 20,
            event_queue_capacity: 512,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let performance_window = env_var_or("PERFORMANCE_WINDOW", "50")
            .parse::<usize>()
            .map_err(|e| EngineError::Config(format!("PERFORMANCE_WINDOW: {e}")))?;

        let training_window = env_var_or("TRAINING_WINDOW", "500")
            .parse::<usize>()
            .map_err(|e| EngineError::Config(format!("TRAINING_WINDOW: {e}")))?;

        let retrain_interval = env_var_or("RETRAIN_INTERVAL", "20")
            .parse::<u64>()
            .map_err(|e| EngineError::Config(format!("RETRAIN_INTERVAL: {e}")))?;

        let event_queue_capacity = env_var_or("EVENT_QUEUE_CAPACITY", "512")
            .parse::<usize>()
            .map_err(|e| EngineError::Config(format!("EVENT_QUEUE_CAPACITY: {e}")))?;

        let config = Self {
            performance_window,
            training_window,
            retrain_interval,
            event_queue_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.performance_window == 0 {
            return Err(EngineError::Config("PERFORMANCE_WINDOW must be positive".into()));
        }
        if self.training_window == 0 {
            return Err(EngineError::Config("TRAINING_WINDOW must be positive".into()));
        }
        if self.retrain_interval == 0 {
            return Err(EngineError::Config("RETRAIN_INTERVAL must be positive".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(EngineError::Config("EVENT_QUEUE_CAPACITY must be positive".into()));
        }
        Ok(())
    }
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
