//! Metrics and alert sinks.

use crate::error::{MonitorError, MonitorResult};
use drift::DriftReport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// One line of the alert log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp_us: u64,
    pub drift_score: f64,
    pub threshold: f64,
    pub feature_drifts: BTreeMap<String, f64>,
    pub drifted_features: Vec<String>,
    pub reference_name: String,
    pub reference_version: u32,
}

impl From<&DriftReport> for AlertRecord {
    fn from(report: &DriftReport) -> Self {
        Self {
            timestamp_us: report.timestamp_us,
            drift_score: report.overall_score,
            threshold: report.threshold,
            feature_drifts: report.per_feature_score.clone(),
            drifted_features: report.drifted_features().into_iter().map(String::from).collect(),
            reference_name: report.reference_name.clone(),
            reference_version: report.reference_version,
        }
    }
}

/// Destination for drift reports and alerts. Implementations must not
/// block the caller for long.
pub trait MetricsSink: Send + Sync {
    fn export(&self, report: &DriftReport) -> MonitorResult<()>;

    fn export_alert(&self, alert: &AlertRecord) -> MonitorResult<()>;
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub feature_scores: BTreeMap<String, f64>,
    pub features_with_drift: usize,
    pub overall_score: f64,
    pub drift_checks_total: u64,
    pub drift_detections_total: u64,
    pub alerts_total: u64,
}

/// In-process gauges and counters, rendered in Prometheus text format
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_report(&self, report: &DriftReport) {
        let mut m = self.inner.lock();
        m.drift_checks_total += 1;
        if report.detected {
            m.drift_detections_total += 1;
        }
        for (feature, score) in &report.per_feature_score {
            m.feature_scores.insert(feature.clone(), *score);
        }
        m.features_with_drift = report.drifted_features().len();
        m.overall_score = report.overall_score;
    }

    pub fn record_alert(&self) {
        self.inner.lock().alerts_total += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }

    /// Prometheus text exposition
    pub fn render(&self) -> String {
        let m = self.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP data_drift_score Drift score per feature");
        let _ = writeln!(out, "# TYPE data_drift_score gauge");
        for (feature, score) in &m.feature_scores {
            let _ = writeln!(out, "data_drift_score{{feature=\"{}\"}} {}", escape_label(feature), score);
        }
        let _ = writeln!(out, "# HELP data_drift_overall_score Largest per-feature drift score");
        let _ = writeln!(out, "# TYPE data_drift_overall_score gauge");
        let _ = writeln!(out, "data_drift_overall_score {}", m.overall_score);
        let _ = writeln!(out, "# HELP features_with_drift Number of features with detected drift");
        let _ = writeln!(out, "# TYPE features_with_drift gauge");
        let _ = writeln!(out, "features_with_drift {}", m.features_with_drift);
        let _ = writeln!(out, "# HELP drift_checks_total Drift checks performed");
        let _ = writeln!(out, "# TYPE drift_checks_total counter");
        let _ = writeln!(out, "drift_checks_total {}", m.drift_checks_total);
        let _ = writeln!(out, "# HELP drift_detections_total Drift detections");
        let _ = writeln!(out, "# TYPE drift_detections_total counter");
        let _ = writeln!(out, "drift_detections_total {}", m.drift_detections_total);
        out
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

impl MetricsSink for MetricsRegistry {
    fn export(&self, report: &DriftReport) -> MonitorResult<()> {
        self.record_report(report);
        Ok(())
    }

    fn export_alert(&self, _alert: &AlertRecord) -> MonitorResult<()> {
        self.record_alert();
        Ok(())
    }
}

/// Appends alerts to a JSONL file; reports are ignored
#[derive(Debug)]
pub struct AlertLogSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AlertLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl MetricsSink for AlertLogSink {
    fn export(&self, _report: &DriftReport) -> MonitorResult<()> {
        Ok(())
    }

    fn export_alert(&self, alert: &AlertRecord) -> MonitorResult<()> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');

        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// Sends everything to several sinks; the first failure is returned after
/// all sinks have been tried
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    fn each(&self, f: impl Fn(&dyn MetricsSink) -> MonitorResult<()>) -> MonitorResult<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = f(sink.as_ref()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl MetricsSink for FanoutSink {
    fn export(&self, report: &DriftReport) -> MonitorResult<()> {
        self.each(|s| s.export(report))
    }

    fn export_alert(&self, alert: &AlertRecord) -> MonitorResult<()> {
        self.each(|s| s.export_alert(alert))
    }
}

#[derive(Debug)]
enum SinkRecord {
    Report(DriftReport),
    Alert(AlertRecord),
}

/// Bounded queue in front of a slower sink, drained by a background task.
/// A full queue drops the record and reports `SinkUnavailable`.
pub struct BufferedSink {
    tx: mpsc::Sender<SinkRecord>,
    dropped: AtomicU64,
}

impl BufferedSink {
    /// Must be called inside a tokio runtime. The drain task ends once
    /// the sink is dropped and the queue is empty.
    pub fn spawn(inner: Arc<dyn MetricsSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let result = match &record {
                    SinkRecord::Report(report) => inner.export(report),
                    SinkRecord::Alert(alert) => inner.export_alert(alert),
                };
                if let Err(e) = result {
                    warn!(error = %e, "buffered sink export failed");
                }
            }
        });
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            handle,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, record: SinkRecord) -> MonitorResult<()> {
        self.tx.try_send(record).map_err(|e| {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "buffer full",
                mpsc::error::TrySendError::Closed(_) => "drain task stopped",
            };
            warn!(dropped, reason, "dropping sink record");
            MonitorError::SinkUnavailable(reason.to_string())
        })
    }
}

impl MetricsSink for BufferedSink {
    fn export(&self, report: &DriftReport) -> MonitorResult<()> {
        self.enqueue(SinkRecord::Report(report.clone()))
    }

    fn export_alert(&self, alert: &AlertRecord) -> MonitorResult<()> {
        self.enqueue(SinkRecord::Alert(alert.clone()))
    }
}
