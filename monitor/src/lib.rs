//! Drift Monitor
//!
//! Wires the aggregator and scorer into a running service: a periodic
//! collect-score-alert controller, an on-demand query surface over the
//! same state, and the sources, sinks, triggers and storage they use.

pub mod config;
pub mod controller;
pub mod error;
pub mod features;
pub mod retrain;
pub mod service;
pub mod sink;
pub mod source;
pub mod state;
pub mod store;

pub use config::{BootstrapPolicy, MeasureKind, MonitorConfig};
pub use features::FeatureSet;
pub use controller::{Controller, ControllerBuilder, ControllerState, CycleOutcome, Phase, Verdict};
pub use error::{MonitorError, MonitorResult, QueryError};
pub use retrain::{LogRetrainTrigger, RetrainRequest, RetrainTrigger};
pub use service::{DriftQuery, DriftService, HealthStatus, QueryData};
pub use sink::{AlertLogSink, AlertRecord, BufferedSink, FanoutSink, MetricsRegistry, MetricsSink};
pub use source::{FallbackSource, JsonlSource, ReadingSource, SyntheticSource};
pub use state::{MonitorState, SharedState};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};

#[cfg(feature = "webhook")]
pub use retrain::WebhookRetrainTrigger;
