/// Domain-specific error types for the calibration engine.
/// Only metrics computation is allowed to fail on bad input. The engine must:
/// - Treat undersized training batches as a skip, not a failure
/// - Always produce a calibrated value, trained or not
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("confidences and accuracies arrays must have same length ({confidences} vs {accuracies})")]
    LengthMismatch { confidences: usize, accuracies: usize },

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
