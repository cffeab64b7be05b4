//! Error types for the monitor.

use drift::DriftError;
use snapshot_format::SnapshotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("reading source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("metrics sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("retrain trigger failed: {0}")]
    RetrainTriggerFailed(String),

    #[error("drift: {0}")]
    Drift(#[from] DriftError),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("blob store: {0}")]
    Store(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// Errors surfaced to on-demand drift queries
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("{0} data is empty")]
    EmptyInput(drift::Side),

    #[error("no common features between reference and current data")]
    NoCommonFeatures,

    #[error("no reference snapshot is loaded")]
    NoReference,
}

impl From<DriftError> for QueryError {
    fn from(err: DriftError) -> Self {
        match err {
            DriftError::EmptyInput(side) => QueryError::EmptyInput(side),
            DriftError::NoCommonFeatures => QueryError::NoCommonFeatures,
        }
    }
}
