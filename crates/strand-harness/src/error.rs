use std::path::PathBuf;

use strand_core::ThreadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("thread runtime error: {0}")]
    Thread(#[from] ThreadError),
    #[error("scenario '{scenario}' failed: {reason}")]
    ScenarioFailed { scenario: String, reason: String },
    #[error("{path}: {errors} invalid record(s) out of {lines}")]
    InvalidLog {
        path: PathBuf,
        lines: usize,
        errors: usize,
    },
}
