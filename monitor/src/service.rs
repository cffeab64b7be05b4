//! On-demand drift queries
//!
//! Request-driven access to the same state the controller updates: score
//! an ad-hoc batch, score the current window now, read the latest report,
//! report health, replace the reference.

use crate::config::{BootstrapPolicy, MonitorConfig};
use crate::error::{MonitorError, MonitorResult, QueryError};
use crate::features::{self, FeatureSet};
use crate::sink::{AlertRecord, MetricsRegistry, MetricsSink};
use crate::state::SharedState;
use crate::store::{self, BlobStore};
use drift::{
    DriftReport, DriftScorer, FeatureTable, ReferenceOrigin, ReferenceSnapshot, Side, TableRow,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use telemetry::{FeatureRow, Reading, WindowAggregator};
use tracing::{info, warn};

/// Data carried by a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryData {
    /// Raw readings, turned into rows the way the controller does
    Readings(Vec<Reading>),
    FeatureRows(Vec<FeatureRow>),
    /// Already-prepared scoring rows
    Rows(Vec<TableRow>),
}

impl Default for QueryData {
    fn default() -> Self {
        QueryData::Readings(Vec::new())
    }
}

impl QueryData {
    fn to_table(&self, template: &WindowAggregator, set: FeatureSet) -> FeatureTable {
        match self {
            QueryData::Readings(readings) => features::table_with(template, readings, set),
            QueryData::FeatureRows(rows) => FeatureTable::from_feature_rows(rows),
            QueryData::Rows(rows) => FeatureTable::from_rows(rows),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftQuery {
    #[serde(default)]
    pub current: QueryData,
    #[serde(default)]
    pub reference: Option<QueryData>,
    /// When false and `reference` is given, score against it instead of
    /// the cached reference
    #[serde(default = "default_true")]
    pub use_cached_reference: bool,
}

impl Default for DriftQuery {
    fn default() -> Self {
        Self {
            current: QueryData::default(),
            reference: None,
            use_cached_reference: true,
        }
    }
}

impl DriftQuery {
    pub fn readings(current: Vec<Reading>) -> Self {
        Self {
            current: QueryData::Readings(current),
            reference: None,
            use_cached_reference: true,
        }
    }

    pub fn against(mut self, reference: QueryData) -> Self {
        self.reference = Some(reference);
        self.use_cached_reference = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub reference_loaded: bool,
    pub reference_name: Option<String>,
    pub reference_version: Option<u32>,
    pub current_window_rows: usize,
    /// Rows set aside toward a bootstrap reference
    pub pending_reference_rows: usize,
    pub last_check_us: Option<u64>,
    pub drift_threshold: f64,
}

#[derive(Clone)]
pub struct DriftService {
    state: SharedState,
    scorer: DriftScorer,
    /// Empty aggregator whose windows each query batch is aggregated with
    template: Arc<WindowAggregator>,
    features: FeatureSet,
    bootstrap: BootstrapPolicy,
    reference_name: String,
    sink: Arc<dyn MetricsSink>,
    store: Option<Arc<dyn BlobStore>>,
}

impl DriftService {
    pub fn new(config: &MonitorConfig, state: SharedState) -> MonitorResult<Self> {
        config.validate()?;
        let template = WindowAggregator::new(config.windows.clone())
            .map_err(|e| MonitorError::Config(e.to_string()))?;
        Ok(Self {
            state,
            scorer: config.scorer(),
            template: Arc::new(template),
            features: config.drift.features,
            bootstrap: config.drift.bootstrap,
            reference_name: config.storage.reference_name.clone(),
            sink: Arc::new(MetricsRegistry::new()),
            store: None,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Score an ad-hoc batch. With no reference loaded and the first-batch
    /// policy, the batch becomes the reference and a bootstrap report is
    /// returned.
    pub async fn calculate(&self, query: DriftQuery) -> Result<DriftReport, QueryError> {
        let now = telemetry::now_us();
        let current = self.table(&query.current, Side::Current)?;

        if let (false, Some(reference)) = (query.use_cached_reference, &query.reference) {
            let reference = ReferenceSnapshot::new(
                "adhoc",
                0,
                now,
                ReferenceOrigin::Loaded,
                self.table(reference, Side::Reference)?,
            );
            let report = self.scorer.score_table(&reference, &current, now)?;
            self.publish(&report);
            return Ok(report);
        }

        let mut state = self.state.lock().await;
        if state.reference.is_none() {
            if self.bootstrap != BootstrapPolicy::FirstBatch {
                return Err(QueryError::NoReference);
            }
            let reference = ReferenceSnapshot::new(
                self.reference_name.clone(),
                1,
                now,
                ReferenceOrigin::Bootstrap,
                current,
            );
            let report = DriftReport::bootstrap(&reference, self.scorer.threshold(), now);
            info!(rows = reference.len(), "no reference loaded, query batch taken as reference");
            self.persist(&reference);
            state.reference = Some(reference);
            state.latest_report = Some(report.clone());
            return Ok(report);
        }

        let report = match &state.reference {
            Some(reference) => self.scorer.score_table(reference, &current, now)?,
            None => return Err(QueryError::NoReference),
        };
        state.latest_report = Some(report.clone());
        drop(state);

        self.publish(&report);
        Ok(report)
    }

    /// Score the shared current window against the reference now
    pub async fn check_now(&self) -> Result<DriftReport, QueryError> {
        let now = telemetry::now_us();
        let mut state = self.state.lock().await;
        let reference = state.reference.as_ref().ok_or(QueryError::NoReference)?;
        let report = self.scorer.score(reference, &state.current, now)?;
        state.latest_report = Some(report.clone());
        state.last_check_us = Some(now);
        drop(state);

        self.publish(&report);
        Ok(report)
    }

    pub async fn latest_report(&self) -> Option<DriftReport> {
        self.state.lock().await.latest_report.clone()
    }

    pub async fn health(&self) -> HealthStatus {
        let state = self.state.lock().await;
        HealthStatus {
            status: "healthy",
            reference_loaded: state.reference.is_some(),
            reference_name: state.reference.as_ref().map(|r| r.name.clone()),
            reference_version: state.reference.as_ref().map(|r| r.version),
            current_window_rows: state.current.len(),
            pending_reference_rows: state.pending_reference.len(),
            last_check_us: state.last_check_us,
            drift_threshold: self.scorer.threshold(),
        }
    }

    /// Swap in a new reference; the version advances by one
    pub async fn replace_reference(&self, data: QueryData) -> Result<ReferenceSnapshot, QueryError> {
        let table = self.table(&data, Side::Reference)?;

        let reference = {
            let mut state = self.state.lock().await;
            state
                .replace_reference(&self.reference_name, table, telemetry::now_us())
                .clone()
        };
        info!(
            name = %reference.name,
            version = reference.version,
            rows = reference.len(),
            "reference replaced"
        );
        self.persist(&reference);
        Ok(reference)
    }

    fn table(&self, data: &QueryData, side: Side) -> Result<FeatureTable, QueryError> {
        let table = data.to_table(&self.template, self.features);
        if table.is_empty() {
            return Err(QueryError::EmptyInput(side));
        }
        Ok(table)
    }

    fn publish(&self, report: &DriftReport) {
        if let Err(e) = self.sink.export(report) {
            warn!(error = %e, "failed to export drift report");
        }
        if report.detected {
            if let Err(e) = self.sink.export_alert(&AlertRecord::from(report)) {
                warn!(error = %e, "failed to export drift alert");
            }
        }
    }

    fn persist(&self, reference: &ReferenceSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store::save_reference(store.as_ref(), reference) {
                warn!(error = %e, "failed to persist reference");
            }
        }
    }
}
