use thiserror::Error;

use crate::evaluator::EvaluatorError;

/// Errors that abort a whole schedule run
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("optimizer not initialized; call initialize() with the sweep first")]
    NotInitialized,

    #[error("wind speed sweep is empty")]
    EmptySweep,

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error("building worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// One wind speed that could not be solved; the rest of the sweep carries on.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("wind speed {uinf} m/s (sweep index {index}): {error}")]
pub struct PointFailure {
    /// Position in the input sequence
    pub index: usize,
    pub uinf: f64,
    #[source]
    pub error: EvaluatorError,
}
