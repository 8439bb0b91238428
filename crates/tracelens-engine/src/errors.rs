use std::time::Duration;

use tracelens_core::ErrorKind;
use tracelens_store::StoreError;

use crate::validator::ValidationReport;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("state failed validation: {}", .0.summary())]
    Validation(ValidationReport),

    #[error("state is {size} bytes, above the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("operation exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Validation(_) => ErrorKind::Validation,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Task(_) => ErrorKind::Internal,
        }
    }

    /// The structured report, when this is a validation failure.
    pub fn validation_report(&self) -> Option<&ValidationReport> {
        match self {
            Self::Validation(report) => Some(report),
            _ => None,
        }
    }
}
